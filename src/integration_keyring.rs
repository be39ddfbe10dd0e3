//! Keyring storage for the Web API refresh token.

use keyring::Entry;

const SPOTIFY_SERVICE_NAME: &str = "spinlog.spotify";
const REFRESH_TOKEN_ACCOUNT: &str = "refresh_token";

fn refresh_token_entry() -> Result<Entry, String> {
    Entry::new(SPOTIFY_SERVICE_NAME, REFRESH_TOKEN_ACCOUNT)
        .map_err(|err| format!("failed to create keyring entry: {err}"))
}

fn keyring_error_hint(error: &str) -> Option<String> {
    if error.contains("org.freedesktop.DBus.Error.ServiceUnknown") {
        return Some(
            "no Secret Service provider is available. Start GNOME Keyring or KeePassXC Secret Service, or set SPOTIFY_REFRESH_TOKEN instead."
                .to_string(),
        );
    }
    None
}

fn format_keyring_error(operation: &str, error: &str) -> String {
    let base = format!("{operation} failed in system keyring: {error}");
    match keyring_error_hint(error) {
        Some(hint) => format!("{base}. Hint: {hint}"),
        None => base,
    }
}

/// Saves the refresh token into the OS keyring.
pub fn set_refresh_token(token: &str) -> Result<(), String> {
    let entry = refresh_token_entry()?;
    entry.set_password(token).map_err(|err| {
        let detail = format!("failed to set keyring password: {err}");
        format_keyring_error("save refresh token", detail.as_str())
    })
}

/// Loads the refresh token from the OS keyring.
pub fn get_refresh_token() -> Result<Option<String>, String> {
    let entry = refresh_token_entry()?;
    match entry.get_password() {
        Ok(token) => Ok(Some(token)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => {
            let detail = format!("failed to get keyring password: {err}");
            Err(format_keyring_error("load refresh token", detail.as_str()))
        }
    }
}
