/*!
 * Scoped multi-camera sessions.
 *
 * A [`CameraSession`] enters every camera of a [`MultiCameras`] on creation
 * and exits them all when closed or dropped, so teardown also runs on early
 * return and panic.
 */
use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use camflow_core::types::Id;

use crate::error::DeviceError;
use crate::registry::{CameraCommand, CommandOutput, MultiCameras};

/// What to do when some cameras fail to enter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Tear everything down and fail
    #[default]
    RequireAll,
    /// Continue with the cameras that entered
    AllowPartial,
}

/// Error type for sessions
#[derive(Error, Debug)]
pub enum SessionError {
    /// Some cameras failed to enter; every camera was torn down again
    #[error("Failed to enter {} of {} cameras", .failures.len(), .total)]
    Enter {
        /// Failure per camera
        failures: BTreeMap<Id, DeviceError>,
        /// Number of cameras in the session
        total: usize,
    },

    /// Some cameras failed their last teardown step
    #[error("Failed to release {} cameras", .failures.len())]
    Teardown {
        /// Failure per camera
        failures: BTreeMap<Id, DeviceError>,
    },

    /// The fan-out itself failed
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DeviceError),
}

/// Fan `exit` out to every camera and collect the failures
///
/// Falls back to exiting cameras one by one on the calling thread when the
/// fan-out cannot spawn its workers.
fn teardown(cameras: &MultiCameras) -> BTreeMap<Id, DeviceError> {
    let results = match cameras.apply(&CameraCommand::Exit) {
        Ok(results) => results,
        Err(e) => {
            warn!("Failed to fan out camera teardown, releasing sequentially: {}", e);
            cameras.read(|camera| camera.exit().map(|_| CommandOutput::Done))
        }
    };

    let failures: BTreeMap<_, _> = results
        .into_iter()
        .filter_map(|(id, result)| result.err().map(|e| (id, e)))
        .collect();
    for (id, e) in &failures {
        warn!("Failed to release camera {}: {}", id, e);
    }
    failures
}

/// Cameras entered together and released together
#[derive(Debug)]
pub struct CameraSession<'a> {
    cameras: &'a MultiCameras,
    failures: BTreeMap<Id, DeviceError>,
    closed: bool,
}

impl<'a> CameraSession<'a> {
    fn open(cameras: &'a MultiCameras, policy: SessionPolicy) -> Result<Self, SessionError> {
        let results = match cameras.apply(&CameraCommand::Enter) {
            Ok(results) => results,
            Err(e) => {
                warn!("Failed to fan out camera setup: {}", e);
                teardown(cameras);
                return Err(SessionError::Dispatch(e));
            }
        };
        let failures: BTreeMap<_, _> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if !failures.is_empty() && policy == SessionPolicy::RequireAll {
            for (id, e) in &failures {
                warn!("Failed to enter camera {}: {}", id, e);
            }
            teardown(cameras);
            return Err(SessionError::Enter {
                failures,
                total: cameras.len(),
            });
        }

        info!(
            "Session started with {} of {} cameras",
            cameras.len() - failures.len(),
            cameras.len()
        );
        Ok(Self {
            cameras,
            failures,
            closed: false,
        })
    }

    /// The cameras in the session, including any that failed to enter
    pub fn cameras(&self) -> &'a MultiCameras {
        self.cameras
    }

    /// Cameras that failed to enter, only non-empty under `AllowPartial`
    pub fn failures(&self) -> &BTreeMap<Id, DeviceError> {
        &self.failures
    }

    /// IDs of the cameras that entered
    pub fn ready_ids(&self) -> Vec<Id> {
        self.cameras
            .ids()
            .into_iter()
            .filter(|id| !self.failures.contains_key(id))
            .collect()
    }

    /// Exit every camera
    pub fn close(mut self) -> Result<(), SessionError> {
        self.closed = true;
        let failures = teardown(self.cameras);
        if failures.is_empty() {
            info!("Session closed");
            Ok(())
        } else {
            Err(SessionError::Teardown { failures })
        }
    }
}

impl Drop for CameraSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let failures = teardown(self.cameras);
            if !failures.is_empty() {
                warn!("Session dropped with {} cameras not released cleanly", failures.len());
            }
        }
    }
}

impl MultiCameras {
    /// Enter every camera
    pub fn session(&self, policy: SessionPolicy) -> Result<CameraSession<'_>, SessionError> {
        CameraSession::open(self, policy)
    }

    /// Enter every camera, run `body`, then exit every camera
    ///
    /// An error from `body` is returned as is and teardown failures are only
    /// logged. When `body` succeeds a teardown failure is returned.
    pub fn scoped<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&CameraSession<'_>) -> Result<T, E>,
        E: From<SessionError>,
    {
        let session = self.session(SessionPolicy::RequireAll)?;
        match body(&session) {
            Ok(value) => {
                session.close()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(teardown) = session.close() {
                    warn!("Teardown after failed session body: {}", teardown);
                }
                Err(e)
            }
        }
    }
}
