//! Read-modify-write of a session record under optimistic concurrency.
//! `mutate` may run once per attempt, always against the latest record.

use log::{debug, warn};
use tokio::time::sleep;
use crate::data::Session;
use crate::retry::RetryPolicy;
use crate::store::{Error, Result, Store, Versioned};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Change {
    Write,
    Skip,
}

/// Returns the written record, or `None` when `mutate` decided there was
/// nothing to write.
pub async fn update<F>(store: &dyn Store, name: &str, policy: &RetryPolicy, mut mutate: F) -> Result<Option<Versioned>>
where
    F: FnMut(&mut Session) -> Change + Send,
{
    let mut attempt = 0;

    loop {
        let error = match attempt_once(store, name, &mut mutate).await {
            Ok(written) => return Ok(written),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        attempt += 1;

        if attempt >= policy.max_attempts {
            warn!("{}: giving up after {} attempts: {}", name, attempt, error);
            return Err(Error::Exhausted { attempts: attempt });
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        debug!("{}: retrying in {:?}: {}", name, delay, error);
        sleep(delay).await;
    }
}

async fn attempt_once<F>(store: &dyn Store, name: &str, mutate: &mut F) -> Result<Option<Versioned>>
where
    F: FnMut(&mut Session) -> Change + Send,
{
    let current = store.get(name).await?;
    let mut next = current.session.clone();

    if mutate(&mut next) == Change::Skip {
        return Ok(None);
    }

    current.session.check_transition(&next)?;

    let version = store.update(current.version, &next).await?;

    Ok(Some(Versioned { version, session: next }))
}
