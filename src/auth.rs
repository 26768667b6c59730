//! MD5 password splice: answer the backend's AuthenticationMD5Password
//! challenge on the client's behalf using credentials from the directory
//! service. The client's own PasswordMessage is read and discarded — it was
//! produced against the bearer token, not the real backend password, so it
//! can never be forwarded.

use md5::Digest as Md5Digest;
use md5::Md5 as Md5Hasher;

/// Compute `"md5" + hex(md5(hex(md5(password + username)) + salt))`, the
/// exact value Postgres expects in the PasswordMessage that answers an
/// AuthenticationMD5Password challenge.
pub fn compute_md5_password(username: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5Hasher::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let phase1 = format!("{:x}", hasher.finalize());

    let mut hasher = Md5Hasher::new();
    hasher.update(phase1.as_bytes());
    hasher.update(salt);
    let phase2 = format!("{:x}", hasher.finalize());

    format!("md5{phase2}")
}
