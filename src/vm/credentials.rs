//! SSH credential preparation for new containers.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::SshCredential;

const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Check that `key` looks like one OpenSSH public key line and return it
/// trimmed.
pub fn validate_public_key(key: &str) -> Result<String> {
    let key = key.trim();
    if key.lines().count() != 1 {
        return Err(EngineError::InvalidRequest(
            "public key must be a single line".into(),
        ));
    }
    let mut parts = key.split_whitespace();
    let (Some(kind), Some(body)) = (parts.next(), parts.next()) else {
        return Err(EngineError::InvalidRequest(
            "public key must be `<type> <base64> [comment]`".into(),
        ));
    };
    if !KEY_TYPES.contains(&kind) {
        return Err(EngineError::InvalidRequest(format!(
            "unsupported public key type `{kind}`"
        )));
    }
    if !body
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
    {
        return Err(EngineError::InvalidRequest(
            "public key body is not base64".into(),
        ));
    }
    Ok(key.to_string())
}

/// Use the caller's key when supplied, otherwise generate a fresh keypair.
pub async fn prepare(admin_user: &str, supplied: Option<&str>, comment: &str) -> Result<SshCredential> {
    match supplied {
        Some(key) => Ok(SshCredential {
            user: admin_user.to_string(),
            public_key: validate_public_key(key)?,
            private_key: None,
        }),
        None => {
            let (public_key, private_key) = generate_keypair(comment).await?;
            Ok(SshCredential {
                user: admin_user.to_string(),
                public_key,
                private_key: Some(private_key),
            })
        }
    }
}

/// Run `ssh-keygen` inside a temporary directory and read both halves back.
/// The directory (and the private key file) is removed before returning.
pub async fn generate_keypair(comment: &str) -> Result<(String, String)> {
    let dir = tempfile::Builder::new()
        .prefix("labctl-key-")
        .tempdir()
        .map_err(|e| EngineError::Provisioning(format!("creating key directory: {e}")))?;
    let key_path = dir.path().join("id_ed25519");

    run_keygen(&key_path, comment).await?;

    let private_key = tokio::fs::read_to_string(&key_path)
        .await
        .map_err(|e| EngineError::Provisioning(format!("reading generated private key: {e}")))?;
    let public_key = tokio::fs::read_to_string(key_path.with_extension("pub"))
        .await
        .map_err(|e| EngineError::Provisioning(format!("reading generated public key: {e}")))?;

    info!(comment, "generated ed25519 keypair");
    Ok((public_key.trim().to_string(), private_key))
}

async fn run_keygen(key_path: &Path, comment: &str) -> Result<()> {
    debug!(path = %key_path.display(), "running ssh-keygen");
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(key_path)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| EngineError::Provisioning(format!("failed to spawn ssh-keygen: {e}")))?;

    if !output.status.success() {
        return Err(EngineError::Provisioning(format!(
            "ssh-keygen exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl lab@host";

    fn have_ssh_keygen() -> bool {
        std::env::var("PATH")
            .map(|p| p.split(':').any(|d| Path::new(d).join("ssh-keygen").exists()))
            .unwrap_or(false)
    }

    #[test]
    fn accepts_well_formed_key() {
        assert_eq!(validate_public_key(&format!("  {GOOD}\n")).expect("valid"), GOOD);
    }

    #[test]
    fn rejects_malformed_keys() {
        for bad in [
            "",
            "ssh-ed25519",
            "ssh-dss AAAAB3NzaC1kc3M=",
            "ssh-ed25519 not*base64",
            "ssh-ed25519 AAAA\nssh-ed25519 BBBB",
        ] {
            assert!(
                matches!(validate_public_key(bad), Err(EngineError::InvalidRequest(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn supplied_key_is_used_without_private_half() {
        let cred = prepare("labuser", Some(GOOD), "unused").await.expect("valid key");
        assert_eq!(cred.user, "labuser");
        assert_eq!(cred.public_key, GOOD);
        assert!(cred.private_key.is_none());
    }

    #[tokio::test]
    async fn generated_keypair_has_both_halves() {
        if !have_ssh_keygen() {
            eprintln!("ssh-keygen not on PATH; skipping");
            return;
        }
        let cred = prepare("labuser", None, "lab-test").await.expect("keygen");
        assert!(cred.public_key.starts_with("ssh-ed25519 "));
        assert!(cred.public_key.ends_with(" lab-test"));
        let private = cred.private_key.expect("generated");
        assert!(private.contains("OPENSSH PRIVATE KEY"));
    }
}
