// Optimistic version control for per-user aggregates.
//
// Each aggregate carries one monotonically increasing counter. Check, apply
// and bump happen under the aggregate's own mutex, so other sessions never
// observe a version whose data is not yet visible. Unrelated users never
// contend on the same mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use parley_common::protocol::errors::ErrorCode;
use parley_common::protocol::push::Push;
use parley_common::types::{SessionId, UserId};
use tracing::debug;

use super::{lock_guard, read_guard, write_guard};
use crate::error::{ServiceError, ServiceResult};
use crate::session::SessionRegistry;

pub type Version = u64;

/// A value plus the version counter that guards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versioned<T> {
    version: Version,
    value: T,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { version: 0, value }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// NOT_MODIFIED when the caller already has the current version.
    pub fn check_read(&self, caller_version: Option<Version>) -> ServiceResult<()> {
        if caller_version == Some(self.version) {
            return Err(ServiceError::from_code(ErrorCode::NotModified));
        }
        Ok(())
    }

    /// CONFLICT when the caller's reference version is stale.
    pub fn check_write(&self, reference: Option<Version>) -> ServiceResult<()> {
        match reference {
            Some(reference) if reference != self.version => Err(ServiceError::from_code(
                ErrorCode::Conflict,
            )
            .with_message(format!(
                "reference version {reference} is stale; current version is {}",
                self.version
            ))),
            _ => Ok(()),
        }
    }

    pub fn bump_and_get(&mut self) -> Version {
        self.version += 1;
        self.version
    }
}

type Aggregate<T> = Arc<Mutex<Versioned<T>>>;

/// Versioned aggregates keyed by owning user, with push fan-out on change.
#[derive(Debug)]
pub struct VersionController<T> {
    aggregates: RwLock<HashMap<UserId, Aggregate<T>>>,
    sessions: Arc<SessionRegistry>,
}

impl<T: Default> VersionController<T> {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { aggregates: RwLock::new(HashMap::new()), sessions }
    }

    fn aggregate(&self, owner: UserId) -> Aggregate<T> {
        if let Some(aggregate) = read_guard(&self.aggregates).get(&owner) {
            return Arc::clone(aggregate);
        }
        Arc::clone(write_guard(&self.aggregates).entry(owner).or_default())
    }

    pub fn current_version(&self, owner: UserId) -> Version {
        read_guard(&self.aggregates)
            .get(&owner)
            .map(|aggregate| lock_guard(aggregate).version())
            .unwrap_or_default()
    }

    /// Read the aggregate unless the caller's cached version is current.
    pub fn check_read<R>(
        &self,
        owner: UserId,
        caller_version: Option<Version>,
        read: impl FnOnce(&T) -> R,
    ) -> ServiceResult<(Version, R)> {
        let aggregate = self.aggregate(owner);
        let guard = lock_guard(&aggregate);
        guard.check_read(caller_version)?;
        Ok((guard.version(), read(guard.value())))
    }

    /// Apply a mutation under the aggregate's mutex.
    ///
    /// The reference version is checked first; a failing check or a failing
    /// `apply` leaves both the value's version and every other session
    /// untouched. On success the new version is pushed to the owner's other
    /// sessions.
    pub fn mutate<R>(
        &self,
        owner: UserId,
        origin: Option<SessionId>,
        reference: Option<Version>,
        apply: impl FnOnce(&mut T) -> ServiceResult<R>,
    ) -> ServiceResult<(Version, R)> {
        let aggregate = self.aggregate(owner);
        let mut guard = lock_guard(&aggregate);
        guard.check_write(reference)?;
        let result = apply(&mut guard.value)?;
        let version = guard.bump_and_get();
        let notified =
            self.sessions.notify_user(owner, origin, Push::ChatListVersionChanged { version });
        debug!(%owner, version, notified, "aggregate version bumped");
        Ok((version, result))
    }

    pub fn remove(&self, owner: UserId) {
        write_guard(&self.aggregates).remove(&owner);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_common::protocol::errors::ErrorCode;
    use parley_common::protocol::push::Push;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{VersionController, Versioned};
    use crate::error::ServiceError;
    use crate::session::{Outbound, SessionRegistry};

    #[test]
    fn versioned_checks_follow_cached_version() {
        let mut versioned = Versioned::new(Vec::<u8>::new());
        assert_eq!(versioned.bump_and_get(), 1);

        assert_eq!(versioned.check_read(Some(1)).unwrap_err().code(), ErrorCode::NotModified);
        versioned.check_read(Some(0)).unwrap();
        versioned.check_read(None).unwrap();

        assert_eq!(versioned.check_write(Some(0)).unwrap_err().code(), ErrorCode::Conflict);
        versioned.check_write(Some(1)).unwrap();
        versioned.check_write(None).unwrap();
    }

    #[test]
    fn mutate_bumps_and_pushes_to_other_sessions() {
        let sessions = Arc::new(SessionRegistry::default());
        let owner = Uuid::new_v4();
        let (origin_tx, mut origin_rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        let origin = sessions.register(owner, origin_tx);
        sessions.register(owner, other_tx);
        let controller: VersionController<Vec<String>> = VersionController::new(sessions);

        let (version, len) = controller
            .mutate(owner, Some(origin.session_id), Some(0), |list| {
                list.push("c1".to_string());
                Ok(list.len())
            })
            .unwrap();

        assert_eq!((version, len), (1, 1));
        assert_eq!(controller.current_version(owner), 1);
        assert!(origin_rx.try_recv().is_err());
        assert_eq!(
            other_rx.try_recv().unwrap(),
            Outbound::Push(Push::ChatListVersionChanged { version: 1 })
        );
    }

    #[test]
    fn stale_write_leaves_aggregate_unchanged() {
        let controller: VersionController<Vec<String>> =
            VersionController::new(Arc::new(SessionRegistry::default()));
        let owner = Uuid::new_v4();
        controller.mutate(owner, None, None, |list| Ok(list.push("a".into()))).unwrap();

        let error = controller
            .mutate(owner, None, Some(0), |list| Ok(list.push("b".into())))
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::Conflict);

        let (version, list) = controller.check_read(owner, None, Clone::clone).unwrap();
        assert_eq!(version, 1);
        assert_eq!(list, vec!["a".to_string()]);
    }

    #[test]
    fn failed_apply_does_not_bump() {
        let controller: VersionController<Vec<String>> =
            VersionController::new(Arc::new(SessionRegistry::default()));
        let owner = Uuid::new_v4();

        let error = controller
            .mutate(owner, None, None, |_| -> Result<(), _> {
                Err(ServiceError::bad_request("nope"))
            })
            .unwrap_err();

        assert_eq!(error.code(), ErrorCode::BadRequest);
        assert_eq!(controller.current_version(owner), 0);
    }

    #[test]
    fn read_at_current_version_is_not_modified() {
        let controller: VersionController<Vec<String>> =
            VersionController::new(Arc::new(SessionRegistry::default()));
        let owner = Uuid::new_v4();

        let error = controller.check_read(owner, Some(0), |list| list.len()).unwrap_err();
        assert_eq!(error.code(), ErrorCode::NotModified);
        assert_eq!(controller.current_version(owner), 0);
    }
}
