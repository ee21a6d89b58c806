//! Directory listing and recursive transfer plans.
//!
//! The recursive walks are breadth-first with two phases per directory:
//! every regular file of a directory is transferred before any of its
//! subdirectories is visited. Entries that cannot be classified or read are
//! skipped and logged at debug level rather than failing the walk.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::debug;

use matic_core::{Error, Result};

use super::{JobPlan, remote_join, require_ok};
use crate::ops::{DiscardOp, MakeDirOp, Op, OpenOp, ReadDirOp, ReadOp, StatOp, WriteOp, open_flags};

const ENOENT: u32 = 2;
const EACCES: u32 = 13;
const EEXIST: u32 = 17;

/// Policy knobs for recursive directory transfers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkPolicy {
    /// Replace files that already exist on the destination side.
    pub overwrite: bool,
    /// Follow symlinks instead of skipping them.
    pub follow: bool,
    /// Skip entries whose name starts with a dot.
    pub no_hidden: bool,
}

fn count(n: u32, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// One parsed line of a remote directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Parse listing text: one `<kind> <name>` line per entry, kinds `f`, `d`,
/// `l`, anything else unclassifiable.
fn parse_listing(text: &str) -> Vec<(EntryKind, String)> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let Some((kind, name)) = line.split_once(' ') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let kind = match kind {
            "f" => EntryKind::File,
            "d" => EntryKind::Directory,
            "l" => EntryKind::Symlink,
            _ => EntryKind::Unknown,
        };
        entries.push((kind, name.to_string()));
    }
    entries
}

// =============================================================================
// Listing
// =============================================================================

/// List a remote directory; the listing becomes the job output.
pub struct ListDirPlan {
    path: String,
    listing: String,
    entries: usize,
}

impl ListDirPlan {
    pub fn new(path: impl Into<String>) -> ListDirPlan {
        ListDirPlan {
            path: path.into(),
            listing: String::new(),
            entries: 0,
        }
    }
}

impl JobPlan for ListDirPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::ReadDir(ReadDirOp::new(&self.path)))),
            Some(Op::ReadDir(op)) => {
                require_ok("read-dir", op.error(), op.failed())?;
                let ticket = op
                    .ticket()
                    .ok_or_else(|| Error::job("read-dir reply carried no ticket"))?;
                Ok(Some(Op::Read(ReadOp::from_ticket(ticket))))
            }
            Some(Op::Read(mut op)) => {
                require_ok("read", op.error(), op.failed())?;
                self.listing = String::from_utf8_lossy(&op.take_data()).into_owned();
                self.entries = parse_listing(&self.listing).len();
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in list-dir",
                other.opcode()
            ))),
        }
    }

    fn output(&mut self) -> String {
        std::mem::take(&mut self.listing)
    }

    fn summary(&self) -> String {
        format!("listed {} ({})", self.path, count(self.entries as u32, "entry"))
    }
}

// =============================================================================
// Upload walk
// =============================================================================

/// Recursively upload a local directory tree.
///
/// Per directory: make-dir on the remote side, enumerate locally, stat each
/// remote file to decide copy-or-skip, copy, then move to the next queued
/// directory. Decisions are captured one per line as job output.
pub struct UploadDirPlan {
    policy: WalkPolicy,
    queue: VecDeque<(PathBuf, String)>,
    cur_local: PathBuf,
    cur_remote: String,
    files: Vec<(PathBuf, String)>,
    file_idx: usize,
    pending_data: Option<Vec<u8>>,
    decisions: String,
    files_copied: u32,
    files_skipped: u32,
    dirs_created: u32,
    entries_ignored: u32,
}

impl UploadDirPlan {
    pub fn new(
        local: impl Into<PathBuf>,
        remote: impl Into<String>,
        policy: WalkPolicy,
    ) -> UploadDirPlan {
        let mut queue = VecDeque::new();
        queue.push_back((local.into(), remote.into()));
        UploadDirPlan {
            policy,
            queue,
            cur_local: PathBuf::new(),
            cur_remote: String::new(),
            files: Vec::new(),
            file_idx: 0,
            pending_data: None,
            decisions: String::new(),
            files_copied: 0,
            files_skipped: 0,
            dirs_created: 0,
            entries_ignored: 0,
        }
    }

    fn decide(&mut self, line: impl AsRef<str>) {
        let _ = writeln!(self.decisions, "{}", line.as_ref());
    }

    /// Pop the next directory off the queue and open it with a make-dir.
    fn start_next_dir(&mut self) -> Result<Option<Op>> {
        let Some((local, remote)) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.cur_local = local;
        self.cur_remote = remote;
        Ok(Some(Op::MakeDir(MakeDirOp::new(&self.cur_remote, 0o755))))
    }

    /// Read the current local directory, splitting entries into files to
    /// copy now and subdirectories to queue for later levels.
    fn enumerate(&mut self) -> Result<()> {
        self.files.clear();
        self.file_idx = 0;
        let mut subdirs = Vec::new();
        for entry in std::fs::read_dir(&self.cur_local)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(dir = %self.cur_local.display(), error = %e, "skipping unreadable entry");
                    self.entries_ignored += 1;
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.policy.no_hidden && name.starts_with('.') {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    debug!(entry = %name, error = %e, "skipping unclassifiable entry");
                    self.entries_ignored += 1;
                    continue;
                }
            };
            let is_dir;
            let is_file;
            if file_type.is_symlink() {
                if !self.policy.follow {
                    self.decide(format!("skipped {} (symlink)", remote_join(&self.cur_remote, &name)));
                    self.entries_ignored += 1;
                    continue;
                }
                match entry.path().metadata() {
                    Ok(meta) => {
                        is_dir = meta.is_dir();
                        is_file = meta.is_file();
                    }
                    Err(e) => {
                        debug!(entry = %name, error = %e, "skipping dangling symlink");
                        self.entries_ignored += 1;
                        continue;
                    }
                }
            } else {
                is_dir = file_type.is_dir();
                is_file = file_type.is_file();
            }
            let remote = remote_join(&self.cur_remote, &name);
            if is_file {
                self.files.push((entry.path(), remote));
            } else if is_dir {
                subdirs.push((entry.path(), remote));
            } else {
                debug!(entry = %name, "skipping special file");
                self.entries_ignored += 1;
            }
        }
        // Deterministic walk order independent of readdir order.
        self.files.sort_by(|a, b| a.1.cmp(&b.1));
        subdirs.sort_by(|a, b| a.1.cmp(&b.1));
        self.queue.extend(subdirs);
        Ok(())
    }

    /// Stat the next pending file, or move on to the next directory.
    fn next_file_op(&mut self) -> Result<Option<Op>> {
        if let Some((_, remote)) = self.files.get(self.file_idx) {
            return Ok(Some(Op::Stat(StatOp::new(remote))));
        }
        self.start_next_dir()
    }

    /// Read the local file and open its remote counterpart for writing.
    fn open_current(&mut self) -> Result<Option<Op>> {
        let (local, remote) = self.files[self.file_idx].clone();
        match std::fs::read(&local) {
            Ok(data) => {
                self.pending_data = Some(data);
                Ok(Some(Op::Open(OpenOp::new(
                    &remote,
                    open_flags::WRITE | open_flags::CREATE | open_flags::TRUNCATE,
                    0o644,
                ))))
            }
            Err(e) => {
                debug!(file = %local.display(), error = %e, "skipping unreadable file");
                self.decide(format!("skipped {remote} (unreadable)"));
                self.entries_ignored += 1;
                self.file_idx += 1;
                self.next_file_op()
            }
        }
    }
}

impl JobPlan for UploadDirPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => self.start_next_dir(),
            Some(Op::MakeDir(op)) => {
                match op.error() {
                    // Destination already present, keep going.
                    Some((EEXIST, _)) => {}
                    Some((errno, message)) => {
                        return Err(Error::job(format!(
                            "make-dir {} failed: errno {errno}: {message}",
                            op.path()
                        )));
                    }
                    None => {
                        self.dirs_created += 1;
                        let line = format!("created {}", self.cur_remote);
                        self.decide(line);
                    }
                }
                self.enumerate()?;
                self.next_file_op()
            }
            Some(Op::Stat(op)) => {
                let (_, remote) = self.files[self.file_idx].clone();
                match (op.info(), op.error()) {
                    (Some(_), _) if !self.policy.overwrite => {
                        self.decide(format!("skipped {remote} (exists)"));
                        self.files_skipped += 1;
                        self.file_idx += 1;
                        self.next_file_op()
                    }
                    (Some(_), _) => self.open_current(),
                    // Absent on the remote side: plain copy.
                    (None, Some((ENOENT, _))) => self.open_current(),
                    (None, Some((EACCES, _))) => {
                        self.decide(format!("skipped {remote} (permission denied)"));
                        self.entries_ignored += 1;
                        self.file_idx += 1;
                        self.next_file_op()
                    }
                    (None, Some((errno, message))) => Err(Error::job(format!(
                        "stat {remote} failed: errno {errno}: {message}"
                    ))),
                    (None, None) => Err(Error::job(format!("stat {remote} returned no data"))),
                }
            }
            Some(Op::Open(op)) => {
                require_ok("open", op.error(), op.failed())?;
                let ticket = op
                    .ticket()
                    .ok_or_else(|| Error::job("open reply carried no ticket"))?;
                let data = self.pending_data.take().unwrap_or_default();
                Ok(Some(Op::Write(WriteOp::new(ticket, data))))
            }
            Some(Op::Write(op)) => {
                require_ok("write", op.error(), op.failed())?;
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                let (_, remote) = self.files[self.file_idx].clone();
                self.decide(format!("uploaded {remote}"));
                self.files_copied += 1;
                self.file_idx += 1;
                self.next_file_op()
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in upload-dir",
                other.opcode()
            ))),
        }
    }

    fn output(&mut self) -> String {
        std::mem::take(&mut self.decisions)
    }

    fn summary(&self) -> String {
        format!(
            "uploaded {}, skipped {}, created {}, ignored {}",
            count(self.files_copied, "file"),
            count(self.files_skipped, "file"),
            count(self.dirs_created, "directory"),
            count(self.entries_ignored, "entry"),
        )
    }
}

// =============================================================================
// Download walk
// =============================================================================

/// What the in-flight ticket read refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetching {
    Listing,
    File,
}

/// Recursively download a remote directory tree.
///
/// Mirror of [`UploadDirPlan`]: per directory a read-dir listing is fetched
/// and classified, files are copied before subdirectories are visited, and
/// existing local files are skipped unless the policy says overwrite.
pub struct DownloadDirPlan {
    policy: WalkPolicy,
    queue: VecDeque<(String, PathBuf)>,
    cur_remote: String,
    cur_local: PathBuf,
    files: Vec<(String, PathBuf)>,
    file_idx: usize,
    fetching: Fetching,
    decisions: String,
    files_copied: u32,
    files_skipped: u32,
    dirs_created: u32,
    entries_ignored: u32,
}

impl DownloadDirPlan {
    pub fn new(
        remote: impl Into<String>,
        local: impl Into<PathBuf>,
        policy: WalkPolicy,
    ) -> DownloadDirPlan {
        let mut queue = VecDeque::new();
        queue.push_back((remote.into(), local.into()));
        DownloadDirPlan {
            policy,
            queue,
            cur_remote: String::new(),
            cur_local: PathBuf::new(),
            files: Vec::new(),
            file_idx: 0,
            fetching: Fetching::Listing,
            decisions: String::new(),
            files_copied: 0,
            files_skipped: 0,
            dirs_created: 0,
            entries_ignored: 0,
        }
    }

    fn decide(&mut self, line: impl AsRef<str>) {
        let _ = writeln!(self.decisions, "{}", line.as_ref());
    }

    /// Pop the next remote directory, create its local mirror and request
    /// the listing.
    fn start_next_dir(&mut self) -> Result<Option<Op>> {
        let Some((remote, local)) = self.queue.pop_front() else {
            return Ok(None);
        };
        if !local.exists() {
            std::fs::create_dir_all(&local)?;
            self.dirs_created += 1;
            self.decide(format!("created {}", local.display()));
        }
        self.cur_remote = remote;
        self.cur_local = local;
        self.fetching = Fetching::Listing;
        Ok(Some(Op::ReadDir(ReadDirOp::new(&self.cur_remote))))
    }

    /// Split the listing into files to copy now and subdirectories to queue.
    fn classify(&mut self, listing: &str) {
        self.files.clear();
        self.file_idx = 0;
        let mut subdirs = Vec::new();
        for (kind, name) in parse_listing(listing) {
            if self.policy.no_hidden && name.starts_with('.') {
                continue;
            }
            let remote = remote_join(&self.cur_remote, &name);
            let local = self.cur_local.join(&name);
            match kind {
                EntryKind::File => self.files.push((remote, local)),
                EntryKind::Directory => subdirs.push((remote, local)),
                EntryKind::Symlink if self.policy.follow => self.files.push((remote, local)),
                EntryKind::Symlink => {
                    self.decide(format!("skipped {remote} (symlink)"));
                    self.entries_ignored += 1;
                }
                EntryKind::Unknown => {
                    debug!(entry = %remote, "skipping unclassifiable entry");
                    self.entries_ignored += 1;
                }
            }
        }
        self.files.sort_by(|a, b| a.0.cmp(&b.0));
        subdirs.sort_by(|a, b| a.0.cmp(&b.0));
        self.queue.extend(subdirs);
    }

    /// Open the next file wanted locally, or move to the next directory.
    fn next_file_op(&mut self) -> Result<Option<Op>> {
        while let Some((remote, local)) = self.files.get(self.file_idx) {
            if local.exists() && !self.policy.overwrite {
                let line = format!("skipped {remote} (exists)");
                self.decide(line);
                self.files_skipped += 1;
                self.file_idx += 1;
                continue;
            }
            return Ok(Some(Op::Open(OpenOp::new(remote, open_flags::READ, 0))));
        }
        self.start_next_dir()
    }
}

impl JobPlan for DownloadDirPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => self.start_next_dir(),
            Some(Op::ReadDir(op)) => match op.error() {
                None => {
                    let ticket = op
                        .ticket()
                        .ok_or_else(|| Error::job("read-dir reply carried no ticket"))?;
                    self.fetching = Fetching::Listing;
                    Ok(Some(Op::Read(ReadOp::from_ticket(ticket))))
                }
                Some((EACCES, _)) => {
                    self.decide(format!("skipped {} (permission denied)", self.cur_remote));
                    self.entries_ignored += 1;
                    self.start_next_dir()
                }
                Some((errno, message)) => Err(Error::job(format!(
                    "read-dir {} failed: errno {errno}: {message}",
                    self.cur_remote
                ))),
            },
            Some(Op::Read(mut op)) => {
                require_ok("read", op.error(), op.failed())?;
                let data = op.take_data();
                match self.fetching {
                    Fetching::Listing => {
                        let listing = String::from_utf8_lossy(&data).into_owned();
                        self.classify(&listing);
                    }
                    Fetching::File => {
                        let (_, local) = &self.files[self.file_idx];
                        std::fs::write(local, &data)?;
                    }
                }
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                if self.fetching == Fetching::File {
                    let (remote, _) = self.files[self.file_idx].clone();
                    self.decide(format!("downloaded {remote}"));
                    self.files_copied += 1;
                    self.file_idx += 1;
                }
                self.next_file_op()
            }
            Some(Op::Open(op)) => match op.error() {
                None => {
                    let ticket = op
                        .ticket()
                        .ok_or_else(|| Error::job("open reply carried no ticket"))?;
                    self.fetching = Fetching::File;
                    Ok(Some(Op::Read(ReadOp::from_ticket(ticket))))
                }
                Some((ENOENT | EACCES, _)) => {
                    let (remote, _) = self.files[self.file_idx].clone();
                    self.decide(format!("skipped {remote} (unreadable)"));
                    self.entries_ignored += 1;
                    self.file_idx += 1;
                    self.next_file_op()
                }
                Some((errno, message)) => {
                    Err(Error::job(format!("open failed: errno {errno}: {message}")))
                }
            },
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in download-dir",
                other.opcode()
            ))),
        }
    }

    fn output(&mut self) -> String {
        std::mem::take(&mut self.decisions)
    }

    fn summary(&self) -> String {
        format!(
            "downloaded {}, skipped {}, created {}, ignored {}",
            count(self.files_copied, "file"),
            count(self.files_skipped, "file"),
            count(self.dirs_created, "directory"),
            count(self.entries_ignored, "entry"),
        )
    }
}
