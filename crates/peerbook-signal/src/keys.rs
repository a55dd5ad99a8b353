//! Persisted key layout

/// `token:<token>` → email, expiring
pub fn token(token: &str) -> String {
    format!("token:{token}")
}

/// `user:<email>` → user id
pub fn user_id(email: &str) -> String {
    format!("user:{email}")
}

/// `u:<id>` → {email, active}
pub fn user(id: &str) -> String {
    format!("u:{id}")
}

/// `user-peerset:<user>` → set of fingerprints
pub fn peer_set(user: &str) -> String {
    format!("user-peerset:{user}")
}

/// `peer:<fingerprint>` → peer hash
pub fn peer(fp: &str) -> String {
    format!("peer:{fp}")
}

pub const PEER_PATTERN: &str = "peer:*";

/// `dontsend:<email>` → "1", expiring
pub fn dont_send(email: &str) -> String {
    format!("dontsend:{email}")
}

/// `QRVerified:<email>` → "1"
pub fn qr_verified(email: &str) -> String {
    format!("QRVerified:{email}")
}

/// `iceserver:<name>` → {urls, username, credential, active}
pub fn ice_server(name: &str) -> String {
    format!("iceserver:{name}")
}

pub const ICE_SERVER_PATTERN: &str = "iceserver:*";

/// `tempid:<id>` → "1"
pub fn temp_id(id: &str) -> String {
    format!("tempid:{id}")
}
