//! Cloud-init boot configuration for new lab containers.
//!
//! The document has three parts:
//!
//! * `packages`: a fixed base list every container gets.
//! * `users`: one sudo-capable account carrying the injected public key, with
//!   password login disabled.
//! * `runcmd`: enable and restart sshd, then one install fragment per selected
//!   dependency, in selection order.
//!
//! Dependency fragments come from [`CATALOG`], a closed compile-time table.
//! Unknown dependency ids are skipped. Each fragment runs as one `runcmd`
//! item headed by a `# label` shell comment.
//!
//! The document is modelled as [`CloudConfig`] and emitted with `serde_yaml`,
//! so user names and keys are always escaped correctly.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Installed on every container before any dependency fragment runs.
pub const BASE_PACKAGES: &[&str] = &["curl", "wget", "ca-certificates", "gnupg", "openssh-server"];

/// One selectable dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub label: &'static str,
    /// Shell fragment run as root from `runcmd`.
    pub install: &'static str,
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "node",
        label: "Node.js 20 LTS",
        install: "curl -fsSL https://deb.nodesource.com/setup_20.x | bash -\n\
                  apt-get install -y nodejs",
    },
    CatalogEntry {
        id: "python",
        label: "Python 3 with pip and venv",
        install: "apt-get install -y python3 python3-pip python3-venv",
    },
    CatalogEntry {
        id: "redis",
        label: "Redis server",
        install: "apt-get install -y redis-server\n\
                  systemctl enable --now redis-server",
    },
    CatalogEntry {
        id: "postgres",
        label: "PostgreSQL server",
        install: "apt-get install -y postgresql postgresql-contrib\n\
                  systemctl enable --now postgresql",
    },
    CatalogEntry {
        id: "mysql",
        label: "MySQL server",
        install: "DEBIAN_FRONTEND=noninteractive apt-get install -y mysql-server\n\
                  systemctl enable --now mysql",
    },
    CatalogEntry {
        id: "docker",
        label: "Docker engine",
        install: "apt-get install -y docker.io\n\
                  systemctl enable --now docker\n\
                  usermod -aG docker {admin_user}",
    },
    CatalogEntry {
        id: "go",
        label: "Go toolchain",
        install: "apt-get install -y golang-go",
    },
    CatalogEntry {
        id: "rust",
        label: "Rust toolchain (rustup, stable)",
        install: "su - {admin_user} -c 'curl -fsSL https://sh.rustup.rs | sh -s -- -y'",
    },
    CatalogEntry {
        id: "java",
        label: "OpenJDK 17",
        install: "apt-get install -y openjdk-17-jdk-headless",
    },
    CatalogEntry {
        id: "git",
        label: "Git",
        install: "apt-get install -y git",
    },
];

pub fn lookup(id: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|entry| entry.id == id)
}

/// Resolve `selection` against the catalog, keeping first-seen order and
/// dropping unknown ids and repeats.
pub fn resolve<S: AsRef<str>>(selection: &[S]) -> Vec<&'static CatalogEntry> {
    let mut out: Vec<&'static CatalogEntry> = Vec::new();
    for id in selection {
        match lookup(id.as_ref().trim()) {
            Some(entry) if !out.iter().any(|seen| seen.id == entry.id) => out.push(entry),
            Some(_) => {}
            None => tracing::debug!(dependency = id.as_ref(), "unknown dependency skipped"),
        }
    }
    out
}

const HEADER: &str = "#cloud-config\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudUser {
    pub name: String,
    pub groups: String,
    pub shell: String,
    pub sudo: String,
    pub lock_passwd: bool,
    pub ssh_authorized_keys: Vec<String>,
}

/// The subset of cloud-config a lab container boots with. Field order is
/// the order cloud-init sees the sections in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub package_update: bool,
    pub packages: Vec<String>,
    pub users: Vec<CloudUser>,
    pub ssh_pwauth: bool,
    pub runcmd: Vec<String>,
}

impl CloudConfig {
    pub fn build<S: AsRef<str>>(admin_user: &str, public_key: &str, selection: &[S]) -> Self {
        let mut runcmd = vec![
            "systemctl enable ssh".to_string(),
            "systemctl restart ssh".to_string(),
        ];
        runcmd.extend(resolve(selection).into_iter().map(|entry| {
            let install = entry.install.replace("{admin_user}", admin_user);
            format!("# {}\n{install}", entry.label)
        }));

        Self {
            package_update: true,
            packages: BASE_PACKAGES.iter().map(|p| p.to_string()).collect(),
            users: vec![CloudUser {
                name: admin_user.to_string(),
                groups: "sudo".into(),
                shell: "/bin/bash".into(),
                sudo: "ALL=(ALL) NOPASSWD:ALL".into(),
                lock_passwd: true,
                ssh_authorized_keys: vec![public_key.trim().to_string()],
            }],
            ssh_pwauth: false,
            runcmd,
        }
    }

    /// The `#cloud-config` document.
    pub fn to_document(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| EngineError::Provisioning(format!("encoding cloud-config: {e}")))?;
        Ok(format!("{HEADER}{yaml}"))
    }

    /// Parse a document produced by [`to_document`](Self::to_document).
    pub fn from_document(doc: &str) -> Result<Self> {
        let yaml = doc.strip_prefix(HEADER).ok_or_else(|| {
            EngineError::Provisioning("cloud-config document lacks its header".into())
        })?;
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Provisioning(format!("decoding cloud-config: {e}")))
    }
}

/// Render the complete `#cloud-config` document.
pub fn render<S: AsRef<str>>(admin_user: &str, public_key: &str, selection: &[S]) -> Result<String> {
    CloudConfig::build(admin_user, public_key, selection).to_document()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ1 lab@test";

    fn rendered<S: AsRef<str>>(admin_user: &str, selection: &[S]) -> CloudConfig {
        let doc = render(admin_user, KEY, selection).expect("rendered");
        assert!(doc.starts_with("#cloud-config\n"));
        CloudConfig::from_document(&doc).expect("valid yaml")
    }

    #[test]
    fn catalog_ids_are_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            assert!(
                CATALOG[i + 1..].iter().all(|b| b.id != a.id),
                "duplicate catalog id {}",
                a.id
            );
        }
    }

    #[test]
    fn base_sections_present_without_dependencies() {
        let config = rendered::<&str>("labuser", &[]);
        assert!(config.package_update);
        assert_eq!(config.packages, BASE_PACKAGES);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].name, "labuser");
        assert_eq!(config.users[0].groups, "sudo");
        assert!(config.users[0].lock_passwd);
        assert_eq!(config.users[0].ssh_authorized_keys, [KEY]);
        assert!(!config.ssh_pwauth);
        assert_eq!(config.runcmd, ["systemctl enable ssh", "systemctl restart ssh"]);
    }

    #[test]
    fn duplicates_and_unknowns_are_dropped() {
        let resolved = resolve(&["go", "cobol", "go", " python "]);
        let ids: Vec<_> = resolved.iter().map(|e| e.id).collect();
        assert_eq!(ids, ["go", "python"]);
    }

    #[test]
    fn admin_user_is_substituted_in_fragments() {
        let config = rendered("alice", &["docker"]);
        let docker = config.runcmd.last().expect("docker fragment");
        assert!(docker.contains("usermod -aG docker alice"));
        assert!(!docker.contains("{admin_user}"));
    }

    #[test]
    fn fragments_keep_their_lines_under_a_label() {
        let config = rendered("labuser", &["node"]);
        assert_eq!(
            config.runcmd[2],
            "# Node.js 20 LTS\n\
             curl -fsSL https://deb.nodesource.com/setup_20.x | bash -\n\
             apt-get install -y nodejs"
        );
    }

    #[test]
    fn yaml_significant_characters_survive() {
        let key = r#"ssh-ed25519 AAAAC3Nza "quoted": comment"#;
        let doc = render("lab: x", key, &["git"]).expect("rendered");
        let config = CloudConfig::from_document(&doc).expect("valid yaml");
        assert_eq!(config.users[0].name, "lab: x");
        assert_eq!(config.users[0].ssh_authorized_keys, [key]);
    }
}
