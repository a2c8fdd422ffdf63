use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time limited TURN credentials derived from a secret shared with the TURN server
/// ([draft-uberti-behave-turn-rest](https://datatracker.ietf.org/doc/html/draft-uberti-behave-turn-rest-00#section-2.2)).
///
/// Returns `(turn_username, turn_password)`, where the username is `<unix-expiry>:<username>`
/// and the password is `base64(HMAC-SHA1(shared_secret, turn_username))`.
pub fn turn_rest_credentials(
    username: &str,
    shared_secret: &str,
    ttl: Duration,
    now: SystemTime,
) -> (String, String) {
    let unix_now = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let expiry = unix_now.saturating_add(ttl).as_secs();

    let turn_username = format!("{expiry}:{username}");

    let mut hmac = Hmac::<Sha1>::new_from_slice(shared_secret.as_bytes())
        .expect("HMAC can take a key of any size");
    hmac.update(turn_username.as_bytes());

    let turn_password = STANDARD.encode(hmac.finalize().into_bytes());

    (turn_username, turn_password)
}
