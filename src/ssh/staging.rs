//! Elevated file staging
//!
//! When commands run as an elevated identity that differs from the
//! connecting one, files owned by the elevated identity cannot be opened
//! directly. Reads copy the file into the connection's temporary directory
//! with an elevated `cp` and make the copy readable; writes go to a temporary
//! file first and are copied into place with an elevated `cp` on close. All
//! other operations run the corresponding elevated shell helper.
//!
//! Temporary files bypass all of this and go straight to the plain access.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::access::FileAccess;
use super::cmdline::CommandLine;
use super::command::RemoteExecutor;
use super::file::{CommitOnClose, RemoteFile, RemoteFileWriter};
use super::tempdir::TempDirectory;
use super::transport::BoxedReader;
use crate::error::Result;

/// [`FileAccess`] for non-temporary paths under elevation
pub struct StagedFileAccess {
    inner: Arc<Staging>,
}

struct Staging {
    executor: RemoteExecutor,
    plain: Arc<dyn FileAccess>,
    temp: Arc<TempDirectory>,
}

impl StagedFileAccess {
    /// `plain` acts as the connecting identity, `executor` runs elevated
    pub fn new(
        executor: RemoteExecutor,
        plain: Arc<dyn FileAccess>,
        temp: Arc<TempDirectory>,
    ) -> Self {
        Self {
            inner: Arc::new(Staging {
                executor,
                plain,
                temp,
            }),
        }
    }
}

impl Staging {
    fn copy_flags(preserve: bool) -> &'static str {
        if preserve {
            "-pr"
        } else {
            "-r"
        }
    }

    async fn run(&self, cmd: CommandLine) -> Result<()> {
        self.executor.execute_checked(&cmd, None).await.map(|_| ())
    }

    async fn test(&self, flag: &str, file: &RemoteFile) -> Result<bool> {
        let output = self
            .executor
            .execute(&CommandLine::build(["test", flag, file.path()]), None)
            .await?;
        Ok(output.success())
    }

    /// Copy `file` into a fresh temporary file readable by the connecting identity
    async fn stage_for_read(&self, file: &RemoteFile) -> Result<RemoteFile> {
        let temp = self.temp.temp_file(file.name()).await?;
        let preserve = self
            .executor
            .spec()
            .elevation
            .preserve_attributes_on_copy_to_temp_file;
        info!(
            "Staging {} through {} on {}",
            file,
            temp,
            self.executor.spec()
        );
        self.run(CommandLine::build([
            "cp",
            Self::copy_flags(preserve),
            file.path(),
            temp.path(),
        ]))
        .await?;
        self.run(CommandLine::build(["chmod", "go+rX", temp.path()]))
            .await?;
        Ok(temp)
    }

    /// Copy a temporary file or directory into place as the elevated identity
    ///
    /// A temporary directory copied onto an existing directory contributes
    /// its contents, not itself.
    async fn copy_from_temp(&self, temp: &RemoteFile, target: &RemoteFile) -> Result<()> {
        let spec = self.executor.spec();
        let os = spec.os;
        let flags = Self::copy_flags(spec.elevation.preserve_attributes_on_copy_from_temp_file);

        let contents_only =
            self.plain.is_directory(temp).await? && self.test("-d", target).await?;
        let cmd = if contents_only {
            debug!("Copying contents of {} into directory {}", temp, target);
            CommandLine::build(["cp", flags])
                .raw(format!(
                    "{}{}*",
                    os.quote(temp.path()),
                    os.file_separator()
                ))
                .arg(target.path())
        } else {
            CommandLine::build(["cp", flags, temp.path(), target.path()])
        };
        self.run(cmd).await?;

        if spec.elevation.override_umask {
            self.run(CommandLine::build(["chmod", "-R", "go+rX", target.path()]))
                .await?;
        }
        Ok(())
    }
}

/// Copies a written temporary file into place when its writer closes
struct StagedCopy {
    staging: Arc<Staging>,
    temp: RemoteFile,
    target: RemoteFile,
}

#[async_trait]
impl CommitOnClose for StagedCopy {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.staging.copy_from_temp(&self.temp, &self.target).await
    }
}

#[async_trait]
impl FileAccess for StagedFileAccess {
    async fn read(&self, file: &RemoteFile) -> Result<BoxedReader> {
        if file.is_temp_file() {
            return self.inner.plain.read(file).await;
        }
        // The staged copy stays until the temporary directory is removed.
        let temp = self.inner.stage_for_read(file).await?;
        self.inner.plain.read(&temp).await
    }

    async fn write(&self, file: &RemoteFile) -> Result<RemoteFileWriter> {
        if file.is_temp_file() {
            return self.inner.plain.write(file).await;
        }
        let temp = self.inner.temp.temp_file(file.name()).await?;
        debug!("Writing {} through {}", file, temp);
        let writer = self.inner.plain.write(&temp).await?;
        Ok(writer.with_commit(Box::new(StagedCopy {
            staging: self.inner.clone(),
            temp,
            target: file.clone(),
        })))
    }

    async fn exists(&self, file: &RemoteFile) -> Result<bool> {
        if file.is_temp_file() {
            return self.inner.plain.exists(file).await;
        }
        self.inner.test("-e", file).await
    }

    async fn is_directory(&self, file: &RemoteFile) -> Result<bool> {
        if file.is_temp_file() {
            return self.inner.plain.is_directory(file).await;
        }
        self.inner.test("-d", file).await
    }

    async fn list(&self, dir: &RemoteFile) -> Result<Vec<RemoteFile>> {
        if dir.is_temp_file() {
            return self.inner.plain.list(dir).await;
        }
        let output = self
            .inner
            .executor
            .execute_checked(&CommandLine::build(["ls", "-1A", dir.path()]), None)
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(|name| dir.child(name))
            .collect())
    }

    async fn mkdir(&self, dir: &RemoteFile) -> Result<()> {
        if dir.is_temp_file() {
            return self.inner.plain.mkdir(dir).await;
        }
        self.inner
            .run(CommandLine::build(["mkdir", dir.path()]))
            .await
    }

    async fn mkdirs(&self, dir: &RemoteFile) -> Result<()> {
        if dir.is_temp_file() {
            return self.inner.plain.mkdirs(dir).await;
        }
        self.inner
            .run(CommandLine::build(["mkdir", "-p", dir.path()]))
            .await
    }

    async fn delete(&self, file: &RemoteFile) -> Result<()> {
        if file.is_temp_file() {
            return self.inner.plain.delete(file).await;
        }
        let cmd = if self.inner.test("-d", file).await? {
            CommandLine::build(["rmdir", file.path()])
        } else {
            CommandLine::build(["rm", "-f", file.path()])
        };
        self.inner.run(cmd).await
    }

    async fn delete_recursively(&self, file: &RemoteFile) -> Result<()> {
        if file.is_temp_file() {
            return self.inner.plain.delete_recursively(file).await;
        }
        self.inner
            .run(CommandLine::build(["rm", "-rf", file.path()]))
            .await
    }

    async fn rename(&self, from: &RemoteFile, to: &RemoteFile) -> Result<()> {
        if from.is_temp_file() && to.is_temp_file() {
            return self.inner.plain.rename(from, to).await;
        }
        self.inner
            .run(CommandLine::build(["mv", from.path(), to.path()]))
            .await
    }

    async fn set_executable(&self, file: &RemoteFile, executable: bool) -> Result<()> {
        if file.is_temp_file() {
            return self.inner.plain.set_executable(file, executable).await;
        }
        let mode = if executable { "a+x" } else { "a-x" };
        self.inner
            .run(CommandLine::build(["chmod", mode, file.path()]))
            .await
    }
}
