use crate::cli::actions::Action;
use anyhow::Result;
use secrecy::SecretString;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Server {
        port: matches.get_one::<u16>("port").copied().unwrap_or(3567),
        installation_secret: matches
            .get_one::<String>("installation-secret")
            .map(|secret| SecretString::from(secret.clone()))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --installation-secret"))?,
        api_origin: matches.get_one::<String>("api-origin").cloned(),
    })
}
