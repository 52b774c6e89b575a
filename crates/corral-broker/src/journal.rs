//! Durable queue state. Every publish and every ack is appended to a
//! per-queue journal file and fsynced before it is acknowledged to the
//! publisher, so queued jobs survive a broker restart. On startup the
//! journal is replayed (publishes minus acks, in publish order) and
//! compacted.

use anyhow::{bail, Context as _, Result};
use std::{
    collections::{HashMap, VecDeque},
    fs::{File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

const SUFFIX: &str = ".journal";

pub struct Journal {
    file: File,
}

impl Journal {
    /// Open the journal for `queue` under `dir`, returning the append handle
    /// and the bodies that were published but never acked, in publish order.
    /// The file is compacted to just those entries as a side effect.
    pub fn open(dir: &Path, queue: &str) -> Result<(Self, VecDeque<String>)> {
        let path = journal_path(dir, queue)?;
        let outstanding = match std::fs::read_to_string(&path) {
            Ok(contents) => replay(&contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading journal `{}`", path.display()))
            }
        };

        let mut compacted = String::new();
        for body in &outstanding {
            compacted.push_str(&format!("+ {body}\n"));
        }
        std::fs::write(&path, compacted)
            .with_context(|| format!("compacting journal `{}`", path.display()))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("opening journal `{}`", path.display()))?;
        Ok((Self { file }, outstanding))
    }

    pub fn record_publish(&mut self, body: &str) -> Result<()> {
        self.append('+', body)
    }

    pub fn record_ack(&mut self, body: &str) -> Result<()> {
        self.append('-', body)
    }

    fn append(&mut self, op: char, body: &str) -> Result<()> {
        if body.contains('\n') {
            bail!("queue message bodies cannot contain newlines");
        }
        self.file.write_all(format!("{op} {body}\n").as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn journal_path(dir: &Path, queue: &str) -> Result<PathBuf> {
    if queue.is_empty() || queue.starts_with('.') || queue.contains(['/', '\0']) {
        bail!("invalid queue name `{queue}`");
    }
    Ok(dir.join(format!("{queue}{SUFFIX}")))
}

fn replay(contents: &str) -> VecDeque<String> {
    let mut outstanding = VecDeque::new();
    for line in contents.lines() {
        match line.split_once(' ') {
            Some(("+", body)) => outstanding.push_back(body.to_string()),
            Some(("-", body)) => {
                if let Some(idx) = outstanding.iter().position(|b| b == body) {
                    outstanding.remove(idx);
                }
            }
            _ => {}
        }
    }
    outstanding
}

/// All journals the broker knows about, keyed by queue name. Queues are
/// discovered from existing journal files at startup and created on first
/// publish or consume thereafter.
pub struct JournalSet {
    dir: PathBuf,
    journals: HashMap<String, Journal>,
}

impl JournalSet {
    pub fn open(dir: impl Into<PathBuf>) -> Result<(Self, HashMap<String, VecDeque<String>>)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating broker state dir `{}`", dir.display()))?;

        let mut journals = HashMap::new();
        let mut initial = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(queue) = name.to_string_lossy().strip_suffix(SUFFIX).map(String::from) else {
                continue;
            };
            let (journal, outstanding) = Journal::open(&dir, &queue)?;
            journals.insert(queue.clone(), journal);
            initial.insert(queue, outstanding);
        }
        Ok((Self { dir, journals }, initial))
    }

    fn journal_for(&mut self, queue: &str) -> Result<&mut Journal> {
        if !self.journals.contains_key(queue) {
            let (journal, _) = Journal::open(&self.dir, queue)?;
            self.journals.insert(queue.to_string(), journal);
        }
        Ok(self.journals.get_mut(queue).unwrap())
    }

    pub fn record_publish(&mut self, queue: &str, body: &str) -> Result<()> {
        self.journal_for(queue)?.record_publish(body)
    }

    pub fn record_ack(&mut self, queue: &str, body: &str) -> Result<()> {
        self.journal_for(queue)?.record_ack(body)
    }
}
