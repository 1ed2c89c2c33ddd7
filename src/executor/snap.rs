//! Installing snaps into a ready instance.
//!
//! Store snaps are downloaded by the guest and installed from the local
//! file, so snapd never refreshes them behind the caller's back. Host snaps
//! are pushed in and installed unasserted.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::Executor;
use crate::backend::{Backend, ExecutionRequest, TransferKind};
use crate::error::ProviderError;

/// Where a snap installed into the guest comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapSource {
    /// Downloaded by the guest from the snap store.
    Store {
        /// Channel to download from, such as `latest/stable`.
        channel: String,
        /// Install with classic confinement.
        classic: bool,
    },
    /// A `.snap` file already on the host.
    Host(Utf8PathBuf),
}

impl SnapSource {
    /// Store snap from `channel` under strict confinement.
    #[must_use]
    pub fn store(channel: impl Into<String>) -> Self {
        Self::Store {
            channel: channel.into(),
            classic: false,
        }
    }
}

/// Snap names are lowercase letters, digits and single hyphens.
fn valid_snap_name(snap: &str) -> bool {
    !snap.is_empty()
        && snap.len() <= 40
        && !snap.starts_with('-')
        && !snap.ends_with('-')
        && !snap.contains("--")
        && snap
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
}

impl<B: Backend + ?Sized> Executor<'_, B> {
    /// Installs `snap` into the guest from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::SnapInstallation`] when the name is invalid,
    /// the host file is missing or a guest step fails, and
    /// [`ProviderError::BackendUnavailable`] when the service is gone.
    pub async fn install_snap(&self, snap: &str, source: &SnapSource) -> Result<(), ProviderError> {
        if !valid_snap_name(snap) {
            return Err(self.snap_error(snap, format!("{snap:?} is not a valid snap name")));
        }
        let guest_snap = format!("/tmp/{snap}.snap");
        match source {
            SnapSource::Store { channel, classic } => {
                self.snap_step(
                    snap,
                    [
                        "snap".to_owned(),
                        "download".to_owned(),
                        snap.to_owned(),
                        format!("--channel={channel}"),
                        format!("--basename={snap}"),
                        "--target-directory=/tmp".to_owned(),
                    ],
                )
                .await?;
                let mut install = vec![
                    "snap".to_owned(),
                    "install".to_owned(),
                    guest_snap.clone(),
                    "--dangerous".to_owned(),
                ];
                if *classic {
                    install.push("--classic".to_owned());
                }
                self.snap_step(snap, install).await?;
            }
            SnapSource::Host(host_snap) => {
                self.snap_step(snap, ["rm".to_owned(), "-f".to_owned(), guest_snap.clone()])
                    .await?;
                self.push_snap(snap, host_snap, Utf8Path::new(&guest_snap)).await?;
                self.snap_step(
                    snap,
                    [
                        "snap".to_owned(),
                        "install".to_owned(),
                        "--dangerous".to_owned(),
                        "--classic".to_owned(),
                        guest_snap.clone(),
                    ],
                )
                .await?;
            }
        }
        info!(instance = %self.name, snap, "snap installed");
        Ok(())
    }

    async fn push_snap(
        &self,
        snap: &str,
        host_snap: &Utf8Path,
        guest_snap: &Utf8Path,
    ) -> Result<(), ProviderError> {
        match self.push(host_snap, guest_snap).await {
            Ok(TransferKind::File) => Ok(()),
            Ok(TransferKind::Directory) => {
                Err(self.snap_error(snap, format!("{host_snap} is a directory, not a snap")))
            }
            Err(err) => Err(self.snap_failure(snap, err)),
        }
    }

    async fn snap_step<I>(&self, snap: &str, command: I) -> Result<(), ProviderError>
    where
        I: IntoIterator<Item = String>,
    {
        self.run_checked(&ExecutionRequest::new(command))
            .await
            .map(|_| ())
            .map_err(|err| self.snap_failure(snap, err))
    }

    fn snap_failure(&self, snap: &str, err: ProviderError) -> ProviderError {
        match err {
            unavailable @ ProviderError::BackendUnavailable { .. } => unavailable,
            other => self.snap_error(snap, other.to_string()),
        }
    }

    fn snap_error(&self, snap: &str, details: String) -> ProviderError {
        ProviderError::SnapInstallation {
            name: self.name.to_string(),
            snap: snap.to_owned(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::valid_snap_name;

    #[rstest]
    #[case("charmcraft", true)]
    #[case("lxd-2", true)]
    #[case("", false)]
    #[case("Upper", false)]
    #[case("../etc", false)]
    #[case("-lead", false)]
    #[case("double--hyphen", false)]
    fn snap_names_are_checked(#[case] snap: &str, #[case] valid: bool) {
        assert_eq!(valid_snap_name(snap), valid);
    }
}
