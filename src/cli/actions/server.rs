use crate::api;
use crate::cli::actions::Action;
use crate::clock::SystemClock;
use crate::config::CoreConfig;
use crate::runtime::RuntimeContext;
use crate::storage::MemoryStorage;
use anyhow::Result;
use std::sync::Arc;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            installation_secret,
            api_origin,
        } => {
            let mut config = CoreConfig::new(installation_secret);
            if let Some(origin) = api_origin {
                config = config.with_api_origin(&origin);
            }

            let ctx = RuntimeContext::new(
                Arc::new(MemoryStorage::new()),
                config,
                Arc::new(SystemClock),
            )?;

            api::serve(port, Arc::new(ctx)).await?;
        }
    }

    Ok(())
}
