use std::os::unix::fs::FileTypeExt;

use anyhow::Context;
use tracing::instrument;

use crate::path;
use crate::progress;

/// Number of concurrently outstanding copy operations.
///
/// This is a static throttle, not a tuned limit; the scheduler suspends at the
/// wait point whenever this many operations are in flight.
pub const MAX_IN_FLIGHT: usize = 8;

/// Error type for copy operations that preserves operation summary even on failure.
///
/// # Logging Convention
/// The Display implementation automatically shows the full error chain, so you can log it
/// with any format specifier:
/// ```ignore
/// tracing::error!("operation failed: {}", &error);   // ✅ Shows full chain
/// tracing::error!("operation failed: {:#}", &error); // ✅ Shows full chain
/// tracing::error!("operation failed: {:?}", &error); // ✅ Shows full chain
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub directories_created: usize,
    pub directories_skipped: usize,
    pub entries_ignored: usize,
    pub entries_dropped: usize,
    pub peak_in_flight: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            files_skipped: self.files_skipped + other.files_skipped,
            directories_created: self.directories_created + other.directories_created,
            directories_skipped: self.directories_skipped + other.directories_skipped,
            entries_ignored: self.entries_ignored + other.entries_ignored,
            entries_dropped: self.entries_dropped + other.entries_dropped,
            peak_in_flight: self.peak_in_flight.max(other.peak_in_flight),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files skipped: {}\n\
            directories created: {}\n\
            directories skipped: {}\n\
            entries ignored: {}\n\
            entries dropped: {}\n\
            peak in-flight operations: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_skipped,
            self.directories_created,
            self.directories_skipped,
            self.entries_ignored,
            self.entries_dropped,
            self.peak_in_flight,
        )
    }
}

/// What a completed operation hands back to the scheduler: its summary delta
/// plus, for directory operations, the child paths discovered one level deep.
#[derive(Debug)]
pub struct Outcome {
    pub summary: Summary,
    pub discovered: Vec<std::path::PathBuf>,
}

impl From<Summary> for Outcome {
    fn from(summary: Summary) -> Self {
        Outcome {
            summary,
            discovered: Vec::new(),
        }
    }
}

#[must_use]
pub fn describe_file_type(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_symlink() {
        "symbolic link"
    } else if file_type.is_block_device() {
        "block device"
    } else if file_type.is_char_device() {
        "character device"
    } else if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_socket() {
        "socket"
    } else {
        "unknown"
    }
}

/// Copies a single regular file with exclusive-create semantics.
///
/// An already existing destination is not an error; the copy is skipped and
/// counted. The file only counts as copied once its bytes have been forced to
/// stable storage.
#[instrument(skip(prog_track))]
pub async fn copy_file(
    prog_track: &'static progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<Summary, Error> {
    let _ops_guard = prog_track.ops.guard();
    tracing::debug!("opening 'src' for reading");
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("failed opening {:?} for reading", &src))
        .map_err(|err| Error::new(err, Default::default()))?;
    let mut writer = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .await
    {
        Ok(writer) => writer,
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::warn!(
                "skipping copy of {:?} -> {:?}, destination already exists",
                &src,
                &dst
            );
            prog_track.files_skipped.inc();
            return Ok(Summary {
                files_skipped: 1,
                ..Default::default()
            });
        }
        Err(error) => {
            return Err(Error::new(
                anyhow::Error::new(error).context(format!("failed creating {:?}", &dst)),
                Default::default(),
            ));
        }
    };
    tracing::debug!("copying data");
    let bytes_copied = tokio::io::copy(&mut reader, &mut writer)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", &src, &dst))
        .map_err(|err| Error::new(err, Default::default()))?;
    drop(writer);
    // the copy is not complete until the destination bytes reach stable storage
    tracing::debug!("syncing 'dst' to stable storage");
    let flushed = tokio::fs::File::open(dst)
        .await
        .with_context(|| format!("failed re-opening {:?} for sync", &dst))
        .map_err(|err| Error::new(err, Default::default()))?;
    flushed
        .sync_all()
        .await
        .with_context(|| format!("failed syncing {:?}", &dst))
        .map_err(|err| Error::new(err, Default::default()))?;
    drop(flushed);
    prog_track.files_copied.inc();
    prog_track.bytes_copied.add(bytes_copied);
    tracing::debug!("done {:?} -> {:?}", &src, &dst);
    Ok(Summary {
        bytes_copied,
        files_copied: 1,
        ..Default::default()
    })
}

/// Mirrors a single directory and enumerates its immediate children.
///
/// The children are not processed here; they travel back to the scheduler in
/// the returned [`Outcome`] and recursion happens only through the shared
/// traversal stack.
#[instrument(skip(prog_track))]
pub async fn copy_directory(
    prog_track: &'static progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<Outcome, Error> {
    let _ops_guard = prog_track.ops.guard();
    let mut summary = Summary::default();
    if let Err(error) = tokio::fs::create_dir(dst).await {
        if error.kind() == std::io::ErrorKind::AlreadyExists {
            tracing::warn!("destination directory {:?} already exists", &dst);
            prog_track.directories_skipped.inc();
            summary.directories_skipped = 1;
        } else {
            return Err(Error::new(
                anyhow::Error::new(error).context(format!("cannot create directory {:?}", &dst)),
                Default::default(),
            ));
        }
    } else {
        prog_track.directories_created.inc();
        summary.directories_created = 1;
    }
    tracing::debug!("enumerating contents of 'src' directory");
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", &src))
        .map_err(|err| Error::new(err, summary))?;
    let mut discovered = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing src directory {:?}", &src))
        .map_err(|err| Error::new(err, summary))?
    {
        discovered.push(entry.path());
    }
    tracing::debug!(
        "done {:?} -> {:?}, discovered {} entries",
        &src,
        &dst,
        discovered.len()
    );
    Ok(Outcome {
        summary,
        discovered,
    })
}

/// The in-flight set: dispatched operations tracked until the scheduler
/// harvests their completion.
///
/// The concurrency ceiling is enforced at the wait point, never at dispatch;
/// the scheduler checks `at_capacity` before deciding to wait and dispatches
/// at most one operation per loop iteration, which keeps the set at no more
/// than [`MAX_IN_FLIGHT`] entries.
struct InFlight {
    operations: tokio::task::JoinSet<Result<Outcome, Error>>,
    peak: usize,
}

impl InFlight {
    fn new() -> Self {
        Self {
            operations: tokio::task::JoinSet::new(),
            peak: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn at_capacity(&self) -> bool {
        self.operations.len() >= MAX_IN_FLIGHT
    }

    fn dispatch<F>(&mut self, operation: F)
    where
        F: std::future::Future<Output = Result<Outcome, Error>> + Send + 'static,
    {
        self.operations.spawn(operation);
        self.peak = self.peak.max(self.operations.len());
    }

    /// Suspends until one outstanding operation finishes, removes it from the
    /// set and returns its outcome. Ties are resolved arbitrarily by the
    /// runtime.
    async fn wait_for_one(&mut self) -> Result<Outcome, Error> {
        let joined = self
            .operations
            .join_next()
            .await
            .expect("in-flight set must not be empty at the wait point!");
        match joined {
            Ok(result) => result,
            // a panicked or cancelled operation is as fatal as a failed one
            Err(error) => Err(Error::new(error.into(), Default::default())),
        }
    }
}

/// The traversal scheduler: exclusive owner of the traversal stack and the
/// in-flight set.
///
/// Both are mutated only from `run`'s single control flow between suspension
/// points, so neither needs a lock.
struct Scheduler {
    prog_track: &'static progress::Progress,
    src_root: std::path::PathBuf,
    dst_root: std::path::PathBuf,
    stack: Vec<std::path::PathBuf>,
    in_flight: InFlight,
    summary: Summary,
}

impl Scheduler {
    fn new(
        prog_track: &'static progress::Progress,
        src_root: std::path::PathBuf,
        dst_root: std::path::PathBuf,
    ) -> Self {
        Self {
            prog_track,
            src_root,
            dst_root,
            stack: Vec::new(),
            in_flight: InFlight::new(),
            summary: Summary::default(),
        }
    }

    /// Harvests one completed operation: merges its summary delta and feeds
    /// any discovered children back onto the traversal stack. A failure
    /// observed here is fatal for the whole run.
    async fn harvest_one(&mut self) -> Result<(), Error> {
        match self.in_flight.wait_for_one().await {
            Ok(outcome) => {
                self.summary = self.summary + outcome.summary;
                self.stack.extend(outcome.discovered);
                Ok(())
            }
            Err(error) => Err(Error::new(error.source, self.summary + error.summary)),
        }
    }

    async fn run(mut self) -> Result<Summary, Error> {
        self.stack.push(self.src_root.clone());
        while !self.stack.is_empty() || !self.in_flight.is_empty() {
            // "stack empty" alone never terminates the run: a directory
            // operation still in flight may yet feed the stack
            if self.in_flight.at_capacity() || self.stack.is_empty() {
                self.harvest_one().await?;
            }
            let Some(source) = self.stack.pop() else {
                continue;
            };
            let metadata = match tokio::fs::symlink_metadata(&source).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    tracing::error!(
                        "failed reading metadata from {:?}: {}, dropping entry",
                        &source,
                        &error
                    );
                    self.prog_track.entries_dropped.inc();
                    self.summary.entries_dropped += 1;
                    continue;
                }
            };
            let destination = path::resolve(&self.src_root, &source, &self.dst_root)
                .map_err(|err| Error::new(err, self.summary))?;
            let file_type = metadata.file_type();
            if file_type.is_file() {
                let prog_track = self.prog_track;
                self.in_flight.dispatch(async move {
                    copy_file(prog_track, &source, &destination)
                        .await
                        .map(Outcome::from)
                });
            } else if file_type.is_dir() {
                let prog_track = self.prog_track;
                self.in_flight
                    .dispatch(async move { copy_directory(prog_track, &source, &destination).await });
            } else {
                tracing::warn!(
                    "skipping {:?}, unsupported entry type: {}",
                    &source,
                    describe_file_type(&file_type)
                );
                self.prog_track.entries_ignored.inc();
                self.summary.entries_ignored += 1;
            }
        }
        self.summary.peak_in_flight = self.in_flight.peak;
        Ok(self.summary)
    }
}

/// Recursively copies `src` to `dst`, overlapping up to [`MAX_IN_FLIGHT`]
/// filesystem operations.
///
/// Entries already present at the destination are skipped, never overwritten.
/// Entries whose metadata cannot be read and entries of unsupported kinds
/// (symbolic links, devices, FIFOs, sockets) are logged and skipped; any
/// other failure aborts the run.
#[instrument(skip(prog_track))]
pub async fn copy(
    prog_track: &'static progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
) -> Result<Summary, Error> {
    let scheduler = Scheduler::new(prog_track, src.to_path_buf(), dst.to_path_buf());
    scheduler.run().await
}

#[cfg(test)]
mod copy_tests {
    use crate::testutils;
    use tracing_test::traced_test;

    use super::*;

    lazy_static::lazy_static! {
        static ref PROGRESS: progress::Progress = progress::Progress::new();
    }

    #[tokio::test]
    #[traced_test]
    async fn check_basic_copy() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        let summary = copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await?;
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.directories_created, 3);
        assert_eq!(summary.files_skipped, 0);
        assert_eq!(summary.directories_skipped, 0);
        assert_eq!(summary.entries_ignored, 0);
        assert_eq!(summary.entries_dropped, 0);
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_single_file_root() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("a.txt");
        let dst = tmp_dir.join("b.txt");
        tokio::fs::write(&src, "hi").await?;
        let summary = copy(&PROGRESS, &src, &dst).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.bytes_copied, 2);
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "hi");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_nested_copy() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        tokio::fs::create_dir_all(src.join("dir1")).await?;
        tokio::fs::write(src.join("dir1").join("b.txt"), "x").await?;
        let dst = tmp_dir.join("dst");
        let summary = copy(&PROGRESS, &src, &dst).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.directories_created, 2);
        assert!(tokio::fs::metadata(dst.join("dir1")).await?.is_dir());
        assert_eq!(
            tokio::fs::read_to_string(dst.join("dir1").join("b.txt")).await?,
            "x"
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_rerun_skips_everything() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await?;
        let summary = copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await?;
        assert_eq!(summary.files_copied, 0);
        assert_eq!(summary.bytes_copied, 0);
        assert_eq!(summary.directories_created, 0);
        assert_eq!(summary.files_skipped, 6);
        assert_eq!(summary.directories_skipped, 3);
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_existing_destination_not_overwritten() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::write(src.join("a.txt"), "new").await?;
        tokio::fs::write(dst.join("a.txt"), "old").await?;
        let summary = copy(&PROGRESS, &src, &dst).await?;
        assert_eq!(summary.files_copied, 0);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.directories_skipped, 1);
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "old");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_unsupported_entry_skipped() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        nix::unistd::mkfifo(
            &test_path.join("foo").join("pipe"),
            nix::sys::stat::Mode::S_IRWXU,
        )?;
        let summary = copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await?;
        assert_eq!(summary.entries_ignored, 1);
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.directories_created, 3);
        assert!(
            tokio::fs::symlink_metadata(test_path.join("bar").join("pipe"))
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_symlink_skipped_not_followed() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        tokio::fs::symlink("0.txt", test_path.join("foo").join("link")).await?;
        let summary = copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await?;
        assert_eq!(summary.entries_ignored, 1);
        assert_eq!(summary.files_copied, 6);
        assert!(
            tokio::fs::symlink_metadata(test_path.join("bar").join("link"))
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_metadata_failure_drops_single_entry() -> Result<(), anyhow::Error> {
        if nix::unistd::geteuid().is_root() {
            // root bypasses permission bits, nothing to exercise
            return Ok(());
        }
        use std::os::unix::fs::PermissionsExt;
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        let locked = test_path.join("foo").join("locked");
        tokio::fs::create_dir(&locked).await?;
        tokio::fs::write(locked.join("x.txt"), "x").await?;
        // readable but not searchable: enumeration succeeds, stat of the
        // child fails
        tokio::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o600)).await?;
        let summary = copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await?;
        assert_eq!(summary.entries_dropped, 1);
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.directories_created, 4);
        assert!(
            tokio::fs::metadata(test_path.join("bar").join("locked"))
                .await?
                .is_dir()
        );
        assert!(
            tokio::fs::metadata(test_path.join("bar").join("locked").join("x.txt"))
                .await
                .is_err()
        );
        tokio::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_concurrency_bound() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        testutils::populate_flat_dir(&src, 20).await?;
        let dst = tmp_dir.join("dst");
        let summary = copy(&PROGRESS, &src, &dst).await?;
        assert_eq!(summary.files_copied, 20);
        assert!(summary.peak_in_flight >= 1);
        assert!(summary.peak_in_flight <= MAX_IN_FLIGHT);
        testutils::check_dirs_identical(&src, &dst).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_deep_tree_terminates() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        let mut leaf = src.clone();
        for idx in 0..12 {
            leaf = leaf.join(format!("level{idx}"));
        }
        tokio::fs::create_dir_all(&leaf).await?;
        tokio::fs::write(leaf.join("deep.txt"), "deep").await?;
        let dst = tmp_dir.join("dst");
        let summary = copy(&PROGRESS, &src, &dst).await?;
        assert_eq!(summary.directories_created, 13);
        assert_eq!(summary.files_copied, 1);
        let mut dst_leaf = dst;
        for idx in 0..12 {
            dst_leaf = dst_leaf.join(format!("level{idx}"));
        }
        assert_eq!(
            tokio::fs::read_to_string(dst_leaf.join("deep.txt")).await?,
            "deep"
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_missing_source_root_is_empty_run() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("does_not_exist");
        let dst = tmp_dir.join("dst");
        let summary = copy(&PROGRESS, &src, &dst).await?;
        assert_eq!(summary.entries_dropped, 1);
        assert_eq!(summary.files_copied, 0);
        assert_eq!(summary.directories_created, 0);
        assert!(tokio::fs::metadata(&dst).await.is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_missing_destination_parent_is_fatal() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        let dst = test_path.join("no").join("such").join("parent");
        match copy(&PROGRESS, &test_path.join("foo"), &dst).await {
            Ok(_) => panic!("Expected the copy to error!"),
            Err(error) => {
                tracing::info!("{}", &error);
            }
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_unreadable_file_is_fatal() -> Result<(), anyhow::Error> {
        if nix::unistd::geteuid().is_root() {
            return Ok(());
        }
        use std::os::unix::fs::PermissionsExt;
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.as_path();
        let unreadable = test_path.join("foo").join("0.txt");
        tokio::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o000)).await?;
        match copy(&PROGRESS, &test_path.join("foo"), &test_path.join("bar")).await {
            Ok(_) => panic!("Expected the copy to error!"),
            Err(error) => {
                let message = format!("{:#}", error.source);
                assert!(
                    message.to_lowercase().contains("permission")
                        || message.contains("denied")
                        || message.contains("EACCES"),
                    "Error message must include permission-related text. Got: {message}"
                );
            }
        }
        tokio::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn admission_bookkeeping() {
        let mut in_flight = InFlight::new();
        assert!(in_flight.is_empty());
        assert!(!in_flight.at_capacity());
        for _ in 0..MAX_IN_FLIGHT {
            in_flight.dispatch(async { Ok(Outcome::from(Summary::default())) });
        }
        assert!(in_flight.at_capacity());
        assert_eq!(in_flight.peak, MAX_IN_FLIGHT);
        while !in_flight.is_empty() {
            in_flight.wait_for_one().await.unwrap();
        }
        assert!(!in_flight.at_capacity());
        assert_eq!(in_flight.peak, MAX_IN_FLIGHT);
    }

    #[tokio::test]
    async fn admission_surfaces_operation_failure() {
        let mut in_flight = InFlight::new();
        in_flight.dispatch(async {
            Err(Error::new(
                anyhow::anyhow!("operation failed"),
                Summary::default(),
            ))
        });
        let result = in_flight.wait_for_one().await;
        assert!(result.is_err());
        assert!(in_flight.is_empty());
    }
}
