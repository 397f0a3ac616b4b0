//! Secure-copy backend. `scp_recv` streams the remote object directly into
//! the destination file rather than buffering it whole.
//!
//! Host-key verification is deliberately left unchecked. This is a known
//! hazard, not an oversight: callers on an untrusted network should prefer
//! the `s3`/`minio` backends or pre-seed `known_hosts` themselves.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::{cleanup_partial, Backend};
use crate::error::{Error, Result};

const RSA_PRIVATE_KEY_FILE: &str = ".ssh/id_rsa";
const SSH_PORT: u16 = 22;

pub struct ScpBackend {
    user: String,
    password: Option<String>,
    host: String,
    remote_path: String,
    session: Mutex<Option<ssh2::Session>>,
}

impl ScpBackend {
    /// Parse `<user>[::<pwd>]@<host>:<path>`.
    pub fn parse(args: &str) -> Result<Self> {
        let bad = || Error::InvalidArgument(format!("bad scp access spec: {args}"));

        let (user, password, rest) = if let Some(idx) = args.find("::") {
            let user = &args[..idx];
            let after = &args[idx + 2..];
            let at = after.find('@').filter(|&i| i != 0).ok_or_else(bad)?;
            (user.to_string(), Some(after[..at].to_string()), &after[at + 1..])
        } else {
            let at = args.find('@').filter(|&i| i != 0).ok_or_else(bad)?;
            (args[..at].to_string(), None, &args[at + 1..])
        };

        let colon = rest.find(':').filter(|&i| i != 0).ok_or_else(bad)?;
        let host = rest[..colon].to_string();
        let remote_path = rest[colon + 1..].to_string();

        Ok(Self {
            user,
            password,
            host,
            remote_path,
            session: Mutex::new(None),
        })
    }
}

impl Backend for ScpBackend {
    fn init(&mut self) -> Result<Option<String>> {
        debug!(user = %self.user, host = %self.host, path = %self.remote_path, "scp backend init");

        let tcp = TcpStream::connect((self.host.as_str(), SSH_PORT))
            .map_err(|e| Error::AuthError(format!("cannot connect to {}: {e}", self.host)))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| Error::AuthError(format!("cannot create ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::AuthError(format!("ssh handshake failed: {e}")))?;

        // Host-key verification intentionally not enforced (see module docs).
        warn!("scp backend does not verify host keys");

        if let Some(password) = &self.password {
            session
                .userauth_password(&self.user, password)
                .map_err(|e| Error::AuthError(format!("password auth failed: {e}")))?;
        } else {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::AuthError("cannot determine home directory".into()))?;
            let key_path = home.join(RSA_PRIVATE_KEY_FILE);
            session
                .userauth_pubkey_file(&self.user, None, &key_path, None)
                .map_err(|e| Error::AuthError(format!("key auth failed: {e}")))?;
        }

        if !session.authenticated() {
            return Err(Error::AuthError("ssh authentication failed".into()));
        }

        *self.session.lock().expect("session lock poisoned") = Some(session);
        Ok(Some(self.remote_path.clone()))
    }

    fn name(&self) -> &str {
        "scp"
    }

    fn get(&self, src: &str, dst: &Path) -> Result<()> {
        let guard = self.session.lock().expect("session lock poisoned");
        let session = guard
            .as_ref()
            .ok_or_else(|| Error::AuthError("scp backend not initialized".into()))?;

        let (mut remote_file, _stat) = session
            .scp_recv(Path::new(src))
            .map_err(|e| Error::io(src, std::io::Error::other(e)))?;

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let result = (|| -> std::io::Result<()> {
            let mut out = std::fs::File::create(dst)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = remote_file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            cleanup_partial(dst);
            return Err(Error::io(dst, e));
        }

        // Required by libssh2 to end the SCP channel cleanly.
        let _ = remote_file.send_eof();
        let _ = remote_file.wait_eof();
        let _ = remote_file.close();
        let _ = remote_file.wait_close();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_password() {
        let b = ScpBackend::parse("alice::secret@host.example:/data").unwrap();
        assert_eq!(b.user, "alice");
        assert_eq!(b.password.as_deref(), Some("secret"));
        assert_eq!(b.host, "host.example");
        assert_eq!(b.remote_path, "/data");
    }

    #[test]
    fn parse_without_password_uses_key_auth() {
        let b = ScpBackend::parse("bob@host.example:/data").unwrap();
        assert_eq!(b.user, "bob");
        assert!(b.password.is_none());
    }

    #[test]
    fn parse_rejects_malformed_spec() {
        assert!(ScpBackend::parse("no-at-sign").is_err());
        assert!(ScpBackend::parse("@host:/data").is_err());
    }
}
