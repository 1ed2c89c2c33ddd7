//! Atomic push and pull of files and directory trees.
//!
//! Everything crosses the backend as a single regular file. Directories are
//! archived on one side and unpacked into a staging location on the other,
//! then renamed over the destination, so a failure at any step leaves the
//! destination either untouched or absent, never half-written.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::archive::{self, Scratch};
use super::{Executor, parent_mkdir, scratch_path};
use crate::backend::{Backend, FileTransfer, TransferDirection, TransferKind, TransferRequest};
use crate::error::ProviderError;

impl<B: Backend + ?Sized> Executor<'_, B> {
    /// Copies a host file or directory to `guest_path`, replacing whatever
    /// was there.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transfer`] when the source is missing or any
    /// step fails.
    pub async fn push(
        &self,
        host_path: &Utf8Path,
        guest_path: &Utf8Path,
    ) -> Result<TransferKind, ProviderError> {
        let kind = archive::host_kind(host_path).map_err(|message| {
            self.transfer_error(TransferDirection::Push, Some(host_path), guest_path, message)
        })?;
        self.transfer(&TransferRequest {
            host_path: host_path.to_path_buf(),
            guest_path: guest_path.to_path_buf(),
            direction: TransferDirection::Push,
            kind,
        })
        .await?;
        Ok(kind)
    }

    /// Copies a guest file or directory to `host_path`, replacing whatever
    /// was there.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transfer`] when the source is missing or any
    /// step fails.
    pub async fn pull(
        &self,
        guest_path: &Utf8Path,
        host_path: &Utf8Path,
    ) -> Result<TransferKind, ProviderError> {
        let kind = self.guest_kind(guest_path).await.map_err(|message| {
            self.transfer_error(TransferDirection::Pull, Some(host_path), guest_path, message)
        })?;
        self.transfer(&TransferRequest {
            host_path: host_path.to_path_buf(),
            guest_path: guest_path.to_path_buf(),
            direction: TransferDirection::Pull,
            kind,
        })
        .await?;
        Ok(kind)
    }

    /// Performs a fully described transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transfer`] when the guest path is relative or
    /// any step fails. Scratch files on both sides are removed on failure.
    pub async fn transfer(&self, request: &TransferRequest) -> Result<(), ProviderError> {
        let guest = request.guest_path.as_path();
        let host = request.host_path.as_path();
        if !guest.is_absolute() {
            return Err(self.transfer_error(
                request.direction,
                Some(host),
                guest,
                "guest path must be absolute".to_owned(),
            ));
        }
        match (request.direction, request.kind) {
            (TransferDirection::Push, TransferKind::File) => self.push_file(host, guest).await,
            (TransferDirection::Push, TransferKind::Directory) => {
                self.push_directory(host, guest).await
            }
            (TransferDirection::Pull, TransferKind::File) => self.pull_file(guest, host).await,
            (TransferDirection::Pull, TransferKind::Directory) => {
                self.pull_directory(guest, host).await
            }
        }?;
        info!(
            instance = %self.name,
            direction = %request.direction,
            host = %host,
            guest = %guest,
            "transfer complete"
        );
        Ok(())
    }

    async fn push_file(&self, host: &Utf8Path, guest: &Utf8Path) -> Result<(), ProviderError> {
        let guest_tmp = scratch_path("");
        let deadline = self.transfer_deadline();
        let steps = async {
            self.send(host, &guest_tmp).await?;
            self.guest_steps(
                &[
                    parent_mkdir(guest),
                    move_into_place(&guest_tmp, guest),
                ],
                deadline,
            )
            .await
        };
        self.finish_transfer(
            TransferDirection::Push,
            Some(host),
            guest,
            steps,
            deadline,
            &[guest_tmp.as_str()],
        )
        .await
    }

    async fn push_directory(&self, host: &Utf8Path, guest: &Utf8Path) -> Result<(), ProviderError> {
        let guest_archive = scratch_path(".tar");
        let staging = guest_staging(guest);
        let deadline = self.transfer_deadline();
        let steps = async {
            let packed = archive::pack_directory(host.to_path_buf()).await?;
            self.send(&packed.archive(), &guest_archive).await?;
            self.guest_steps(
                &[
                    parent_mkdir(guest),
                    argv(["mkdir", "-p", staging.as_str()]),
                    argv(["tar", "-xf", guest_archive.as_str(), "-C", staging.as_str()]),
                    argv(["rm", "-rf", "--", guest.as_str()]),
                    argv(["mv", "-T", staging.as_str(), guest.as_str()]),
                    argv(["rm", "-f", "--", guest_archive.as_str()]),
                ],
                deadline,
            )
            .await
        };
        self.finish_transfer(
            TransferDirection::Push,
            Some(host),
            guest,
            steps,
            deadline,
            &[staging.as_str(), guest_archive.as_str()],
        )
        .await
    }

    async fn pull_file(&self, guest: &Utf8Path, host: &Utf8Path) -> Result<(), ProviderError> {
        let guest_tmp = scratch_path("");
        let deadline = self.transfer_deadline();
        let steps = async {
            self.guest_steps(
                &[
                    argv(["cp", "-f", "--", guest.as_str(), guest_tmp.as_str()]),
                    argv(["chmod", "a+r", guest_tmp.as_str()]),
                ],
                deadline,
            )
            .await?;
            let scratch = Scratch::beside(host)?;
            self.receive(&guest_tmp, &scratch.payload()).await?;
            archive::replace(&scratch.payload(), host)
        };
        let outcome = self
            .finish_transfer(
                TransferDirection::Pull,
                Some(host),
                guest,
                steps,
                deadline,
                &[guest_tmp.as_str()],
            )
            .await;
        if outcome.is_ok() {
            self.cleanup_guest(&[guest_tmp.as_str()]).await;
        }
        outcome
    }

    async fn pull_directory(&self, guest: &Utf8Path, host: &Utf8Path) -> Result<(), ProviderError> {
        let guest_archive = scratch_path(".tar");
        let deadline = self.transfer_deadline();
        let steps = async {
            self.guest_steps(
                &[
                    argv(["tar", "-cf", guest_archive.as_str(), "-C", guest.as_str(), "."]),
                    argv(["chmod", "a+r", guest_archive.as_str()]),
                ],
                deadline,
            )
            .await?;
            let scratch = Scratch::beside(host)?;
            self.receive(&guest_archive, &scratch.archive()).await?;
            archive::unpack_archive(scratch.archive(), scratch.tree()).await?;
            archive::replace(&scratch.tree(), host)
        };
        let outcome = self
            .finish_transfer(
                TransferDirection::Pull,
                Some(host),
                guest,
                steps,
                deadline,
                &[guest_archive.as_str()],
            )
            .await;
        if outcome.is_ok() {
            self.cleanup_guest(&[guest_archive.as_str()]).await;
        }
        outcome
    }

    async fn send(&self, host: &Utf8Path, guest: &str) -> Result<(), String> {
        self.backend
            .transfer(
                self.name,
                &FileTransfer {
                    host_path: host.to_path_buf(),
                    guest_path: Utf8PathBuf::from(guest),
                    direction: TransferDirection::Push,
                },
            )
            .await
            .map_err(|err| err.to_string())
    }

    async fn receive(&self, guest: &str, host: &Utf8Path) -> Result<(), String> {
        self.backend
            .transfer(
                self.name,
                &FileTransfer {
                    host_path: host.to_path_buf(),
                    guest_path: Utf8PathBuf::from(guest),
                    direction: TransferDirection::Pull,
                },
            )
            .await
            .map_err(|err| err.to_string())
    }

    async fn guest_kind(&self, guest: &Utf8Path) -> Result<TransferKind, String> {
        let deadline = self.transfer_deadline();
        for (flag, kind) in [("-d", TransferKind::Directory), ("-f", TransferKind::File)] {
            let probe_argv = argv(["test", flag, guest.as_str()]);
            let probe = self.guest_command(&probe_argv, deadline);
            let output = tokio::time::timeout_at(deadline, probe)
                .await
                .map_err(|_| format!("could not inspect {guest} in time"))??;
            if output.is_success() {
                return Ok(kind);
            }
        }
        Err(format!("{guest} does not exist in the instance"))
    }
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_owned()).collect()
}

fn move_into_place(staged: &str, guest: &Utf8Path) -> Vec<String> {
    argv(["mv", "-f", "-T", staged, guest.as_str()])
}

/// Hidden sibling of `guest` used to assemble a directory before it replaces
/// the destination.
fn guest_staging(guest: &Utf8Path) -> Utf8PathBuf {
    let parent = guest.parent().unwrap_or_else(|| Utf8Path::new("/"));
    let leaf = guest.file_name().unwrap_or("root");
    parent.join(format!(".{leaf}.kiln-{}", uuid::Uuid::new_v4().simple()))
}
