//! One-shot registration of a new companion device.

use std::sync::Arc;

use super::run_session;
use crate::auth::Authenticator;
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{Dispatcher, SessionOutcome};
use crate::transport::{self, Connector, Endpoint};

/// Connect to `endpoint`, send `REQUEST_KEYS` and run until the device is
/// registered or the session fails.
///
/// Connect failures are returned as errors; everything after the connection
/// is open is reported in the [`SessionOutcome`].
pub async fn register_device(
    authenticator: Arc<dyn Authenticator>,
    connector: &dyn Connector,
    endpoint: &Endpoint,
    config: &Config,
) -> Result<SessionOutcome> {
    let connection = transport::connect(connector, endpoint, &config.transport).await?;

    let mut dispatcher = Dispatcher::new(
        authenticator,
        &connection,
        None,
        config.session.attempt_ttl(),
    );
    dispatcher.request_keys().await?;

    Ok(run_session(connection, dispatcher, config.session.session_timeout()).await)
}
