use std::{
    collections::BTreeSet,
    io::{BufRead, BufReader, Read, Write},
    ops::Bound,
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{Mutex, MutexGuard},
};

use super::{ObjectKind, ObjectStore, RawObject};
use crate::{
    error::Error,
    identity::{abbreviate, ObjectId},
};

/// Object store backed by the `git` executable, so packed objects are visible too.
///
/// Reads go through one long-lived `git cat-file --batch` process.
pub struct GitCliStore {
    git_dir: PathBuf,
    objects_dir: PathBuf,
    batch: Mutex<Option<CatFileBatch>>,
    /// Ids seen so far, used to compute unique abbreviations
    known: Mutex<BTreeSet<ObjectId>>,
}

struct CatFileBatch {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl CatFileBatch {
    fn spawn(git_dir: &Path) -> Result<Self, Error> {
        let mut child = Command::new("git")
            .arg("--git-dir")
            .arg(git_dir)
            .args(["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::StoreUnavailable(format!("failed to spawn git cat-file: {}", e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::StoreUnavailable("git cat-file stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::StoreUnavailable("git cat-file stdout not captured".to_string())
        })?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Request one object. `None` when git reports it missing.
    fn read(&mut self, id: &ObjectId) -> Result<Option<(ObjectKind, u64, Vec<u8>)>, Error> {
        writeln!(self.stdin, "{}", id)?;
        self.stdin.flush()?;

        // Format: "<oid> <type> <size>\n<content>\n" or "<oid> missing\n"
        let mut header = String::new();
        if self.stdout.read_line(&mut header)? == 0 {
            return Err(Error::StoreUnavailable(
                "git cat-file exited unexpectedly".to_string(),
            ));
        }

        let parts: Vec<&str> = header.split_whitespace().collect();
        match parts.as_slice() {
            [_, "missing"] => Ok(None),
            [_, type_name, size] => {
                let size: u64 = size.parse().map_err(|_| {
                    Error::malformed(id, format!("invalid size from git cat-file: {}", size))
                })?;
                let mut data = vec![0u8; size as usize];
                self.stdout.read_exact(&mut data)?;
                let mut newline = [0u8; 1];
                self.stdout.read_exact(&mut newline)?;
                Ok(Some((
                    ObjectKind::from_type_name(type_name.as_bytes()),
                    size,
                    data,
                )))
            }
            _ => Err(Error::StoreUnavailable(format!(
                "unexpected git cat-file output: {}",
                header.trim_end()
            ))),
        }
    }
}

impl Drop for CatFileBatch {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl GitCliStore {
    /// Open the repository at `repo_root`, failing if git does not recognise it
    pub fn open<P: AsRef<Path>>(repo_root: P) -> Result<Self, Error> {
        let repo_root = repo_root.as_ref();
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(["rev-parse", "--absolute-git-dir"])
            .output()
            .map_err(|e| Error::StoreUnavailable(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::StoreUnavailable(format!(
                "{}: {}",
                repo_root.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let git_dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        let objects_dir = git_dir.join("objects");
        tracing::debug!("Opened git object database at {:?}", git_dir);

        Ok(Self {
            git_dir,
            objects_dir,
            batch: Mutex::new(None),
            known: Mutex::new(BTreeSet::new()),
        })
    }

    fn git(&self, args: &[&str]) -> Result<Vec<u8>, Error> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.git_dir)
            .args(args)
            .output()
            .map_err(|e| Error::StoreUnavailable(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::StoreUnavailable(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn known(&self) -> Result<MutexGuard<'_, BTreeSet<ObjectId>>, Error> {
        self.known
            .lock()
            .map_err(|_| Error::StoreUnavailable("abbreviation index poisoned".to_string()))
    }
}

impl ObjectStore for GitCliStore {
    fn enumerate(&self) -> Result<Vec<ObjectId>, Error> {
        let stdout = self.git(&[
            "cat-file",
            "--batch-all-objects",
            "--batch-check=%(objectname)",
        ])?;

        let ids: Vec<ObjectId> = String::from_utf8_lossy(&stdout)
            .lines()
            .filter_map(|line| ObjectId::from_hex(line.trim()))
            .collect();

        self.known()?.extend(ids.iter().cloned());
        Ok(ids)
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject, Error> {
        let result = {
            let mut slot = self
                .batch
                .lock()
                .map_err(|_| Error::StoreUnavailable("git cat-file handle poisoned".to_string()))?;
            if slot.is_none() {
                *slot = Some(CatFileBatch::spawn(&self.git_dir)?);
            }
            let batch = slot.as_mut().ok_or_else(|| {
                Error::StoreUnavailable("git cat-file not running".to_string())
            })?;
            let result = batch.read(id);
            if matches!(result, Err(Error::Io(_)) | Err(Error::StoreUnavailable(_))) {
                // Stream is out of sync; start a fresh process on the next read.
                *slot = None;
            }
            result?
        };

        let (kind, size, data) = result.ok_or_else(|| Error::NotFound(id.clone()))?;
        let short_id = self.short_id(id)?;
        self.known()?.insert(id.clone());

        Ok(RawObject {
            kind,
            size,
            short_id,
            data,
        })
    }

    fn short_id(&self, id: &ObjectId) -> Result<String, Error> {
        if self.known()?.is_empty() {
            self.enumerate()?;
        }
        let known = self.known()?;
        let before = known.range(..id.clone()).next_back();
        let after = known
            .range((Bound::Excluded(id.clone()), Bound::Unbounded))
            .next();
        Ok(abbreviate(
            id,
            before.into_iter().chain(after).map(ObjectId::as_str),
        ))
    }

    fn resolve_head(&self) -> Result<ObjectId, Error> {
        let stdout = self.git(&["rev-parse", "--verify", "HEAD^{commit}"])?;
        let head = String::from_utf8_lossy(&stdout);
        ObjectId::from_hex(head.trim())
            .ok_or_else(|| Error::StoreUnavailable(format!("HEAD does not resolve: {}", head.trim())))
    }

    fn objects_dir(&self) -> Option<&Path> {
        Some(&self.objects_dir)
    }
}
