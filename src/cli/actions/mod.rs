pub mod server;

use secrecy::SecretString;

/// What the CLI resolved to after parsing.
#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        installation_secret: SecretString,
        api_origin: Option<String>,
    },
}
