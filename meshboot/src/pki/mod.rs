//! Internal certificate authority.
//!
//! One root CA per deploy, one leaf pair per host, all held as PEM files
//! under the CA directory on the coordinating node. Every artifact moves
//! through `Absent -> Generating -> Present`: generation writes a temp
//! file and renames it into place, so a failed signing run can never
//! corrupt material that is already `Present`.
//!
//! Idempotence is keyed on artifact existence, not content validity: an
//! expired or corrupted certificate is never regenerated automatically.

use std::fs;
use std::path::{Path, PathBuf};

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::runner::{HostRunner, Outcome, RemoteCommand};
use crate::topology::Node;

/// Directory on every cluster member holding the CA cert and the host's
/// own leaf pair.
pub const TRUST_DIR: &str = "/etc/mesh/pki";

/// Root CA validity window, days.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Lifecycle state of one on-disk artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    /// A temp file exists from an interrupted write; the rename never
    /// happened, so the artifact does not count as present.
    Generating,
    Present,
}

pub fn artifact_state(path: &Path) -> ArtifactState {
    if path.exists() {
        ArtifactState::Present
    } else if tmp_path(path).exists() {
        ArtifactState::Generating
    } else {
        ArtifactState::Absent
    }
}

/// The single idempotency predicate consulted before every mutating call.
pub fn exists(path: &Path) -> bool {
    artifact_state(path) == ArtifactState::Present
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", path.display()))
}

/// Write an artifact atomically with the given mode.
fn write_artifact(path: &Path, contents: &str, mode: u32) -> MeshbootResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn pki_err(e: impl std::fmt::Display) -> MeshbootError {
    MeshbootError::Pki(e.to_string())
}

#[derive(Debug, Clone)]
pub struct RootCa {
    pub key_pem: String,
    pub cert_pem: String,
}

#[derive(Debug, Clone)]
pub struct LeafCert {
    pub host: String,
    pub key_pem: String,
    pub cert_pem: String,
}

/// Owns root CA material and issues per-host leaf certificates.
pub struct CaManager {
    dir: PathBuf,
    deploy_name: String,
}

impl CaManager {
    pub fn new(dir: impl Into<PathBuf>, deploy_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            deploy_name: deploy_name.into(),
        }
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.dir.join("ca").join("ca.key")
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join("ca").join("ca.crt")
    }

    pub fn leaf_key_path(&self, host: &str) -> PathBuf {
        self.dir.join("hosts").join(host).join(format!("{host}.key"))
    }

    pub fn leaf_cert_path(&self, host: &str) -> PathBuf {
        self.dir.join("hosts").join(host).join(format!("{host}.crt"))
    }

    /// Idempotently ensure root CA material.
    ///
    /// When the root is already `Present` the existing files are returned
    /// byte for byte, untouched. Generation failure leaves nothing behind
    /// but a temp file and aborts the PKI stage.
    pub fn ensure_root(&self) -> MeshbootResult<RootCa> {
        let key_path = self.root_key_path();
        let cert_path = self.root_cert_path();

        if exists(&cert_path) && exists(&key_path) {
            tracing::debug!(deploy = %self.deploy_name, "root CA already present");
            return Ok(RootCa {
                key_pem: fs::read_to_string(&key_path)?,
                cert_pem: fs::read_to_string(&cert_path)?,
            });
        }

        tracing::info!(deploy = %self.deploy_name, "generating root CA");
        let mut params = rcgen::CertificateParams::new(Vec::new());
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(
            rcgen::DnType::CommonName,
            format!("{} root CA", self.deploy_name),
        );
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(CA_VALIDITY_DAYS);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
        ];

        let cert = rcgen::Certificate::from_params(params).map_err(pki_err)?;
        let key_pem = cert.serialize_private_key_pem();
        let cert_pem = cert.serialize_pem().map_err(pki_err)?;

        // Key first, owner-read-only; cert is public material.
        write_artifact(&key_path, &key_pem, 0o600)?;
        write_artifact(&cert_path, &cert_pem, 0o644)?;

        Ok(RootCa { key_pem, cert_pem })
    }

    /// Rebuild a signing handle from the stored root material.
    fn root_signer(&self) -> MeshbootResult<rcgen::Certificate> {
        let key_pem = fs::read_to_string(self.root_key_path())?;
        let cert_pem = fs::read_to_string(self.root_cert_path())?;
        let key_pair = rcgen::KeyPair::from_pem(&key_pem).map_err(pki_err)?;
        let params =
            rcgen::CertificateParams::from_ca_cert_pem(&cert_pem, key_pair).map_err(pki_err)?;
        rcgen::Certificate::from_params(params).map_err(pki_err)
    }

    /// Idempotently ensure a leaf pair for the host, signed by the root.
    ///
    /// Requires a `Present` root. A signing failure is fatal for this
    /// host only and cannot touch the root material (the root is only
    /// ever read here).
    pub fn ensure_leaf(&self, node: &Node) -> MeshbootResult<LeafCert> {
        if !exists(&self.root_cert_path()) || !exists(&self.root_key_path()) {
            return Err(MeshbootError::Pki(
                "root CA material missing: run ensure_root first".into(),
            ));
        }

        let key_path = self.leaf_key_path(&node.name);
        let cert_path = self.leaf_cert_path(&node.name);

        if exists(&cert_path) && exists(&key_path) {
            tracing::debug!(host = %node.name, "leaf certificate already present");
            return Ok(LeafCert {
                host: node.name.clone(),
                key_pem: fs::read_to_string(&key_path)?,
                cert_pem: fs::read_to_string(&cert_path)?,
            });
        }

        tracing::info!(host = %node.name, "issuing leaf certificate");
        let signer = self.root_signer()?;

        let mut params = rcgen::CertificateParams::new(vec![node.name.clone()]);
        params
            .subject_alt_names
            .push(rcgen::SanType::IpAddress(node.mesh_ip));
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, node.name.clone());
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(CA_VALIDITY_DAYS);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let cert = rcgen::Certificate::from_params(params).map_err(pki_err)?;
        let key_pem = cert.serialize_private_key_pem();
        let cert_pem = cert.serialize_pem_with_signer(&signer).map_err(pki_err)?;

        write_artifact(&key_path, &key_pem, 0o600)?;
        write_artifact(&cert_path, &cert_pem, 0o644)?;

        Ok(LeafCert {
            host: node.name.clone(),
            key_pem,
            cert_pem,
        })
    }

    /// Install the CA cert plus the host's own leaf pair into the host's
    /// trust directory. Idempotent: artifacts already present on the host
    /// are skipped.
    pub async fn distribute(
        &self,
        runner: &HostRunner,
        node: &Node,
        leaf: &LeafCert,
        root: &RootCa,
    ) -> MeshbootResult<Outcome> {
        let artifacts: [(String, String, u32); 3] = [
            ("ca.crt".to_string(), root.cert_pem.clone(), 0o644),
            (format!("{}.key", node.name), leaf.key_pem.clone(), 0o600),
            (format!("{}.crt", node.name), leaf.cert_pem.clone(), 0o644),
        ];

        let transport = runner.transport();
        let mut any_applied = false;
        for (name, contents, mode) in artifacts {
            let remote_path = format!("{TRUST_DIR}/{name}");
            let check = RemoteCommand::new(["test", "-s", &remote_path]);
            if transport.exec(node, &check).await?.ok() {
                continue;
            }
            transport
                .upload(node, contents.as_bytes(), &remote_path, mode)
                .await?;
            any_applied = true;
        }

        if any_applied {
            tracing::info!(host = %node.name, "certificate material distributed");
            Ok(Outcome::Applied)
        } else {
            Ok(Outcome::AlreadySatisfied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MemoryTransport;
    use crate::runner::RetryPolicy;
    use crate::topology::{NodeSpec, Role, Topology};
    use std::sync::Arc;

    fn test_topology() -> Topology {
        Topology::resolve(vec![NodeSpec {
            name: "node-1".into(),
            mesh_ip: "10.0.0.1".into(),
            mesh_nic: "eth1".into(),
            roles: vec![Role::PrimaryNode, Role::NetworkNode, Role::EtcdMaster],
        }])
        .unwrap()
    }

    #[test]
    fn ensure_root_is_byte_identical_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CaManager::new(dir.path(), "testdeploy");

        let first = ca.ensure_root().unwrap();
        let second = ca.ensure_root().unwrap();
        assert_eq!(first.key_pem, second.key_pem);
        assert_eq!(first.cert_pem, second.cert_pem);
        assert!(first.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn ensure_leaf_never_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CaManager::new(dir.path(), "testdeploy");
        let topo = test_topology();
        let node = &topo.nodes()[0];

        ca.ensure_root().unwrap();
        let first = ca.ensure_leaf(node).unwrap();
        let mtime_before = fs::metadata(ca.leaf_key_path(&node.name))
            .unwrap()
            .modified()
            .unwrap();

        let second = ca.ensure_leaf(node).unwrap();
        let mtime_after = fs::metadata(ca.leaf_key_path(&node.name))
            .unwrap()
            .modified()
            .unwrap();

        assert_eq!(first.key_pem, second.key_pem);
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn ensure_leaf_requires_root() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CaManager::new(dir.path(), "testdeploy");
        let topo = test_topology();

        let err = ca.ensure_leaf(&topo.nodes()[0]).unwrap_err();
        assert!(matches!(err, MeshbootError::Pki(_)));
    }

    #[test]
    fn interrupted_write_reads_as_generating_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CaManager::new(dir.path(), "testdeploy");
        let cert_path = ca.root_cert_path();

        fs::create_dir_all(cert_path.parent().unwrap()).unwrap();
        fs::write(tmp_path(&cert_path), "partial").unwrap();

        assert_eq!(artifact_state(&cert_path), ArtifactState::Generating);
        assert!(!exists(&cert_path));
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ca = CaManager::new(dir.path(), "testdeploy");
        ca.ensure_root().unwrap();

        let mode = fs::metadata(ca.root_key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn distribute_skips_present_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CaManager::new(dir.path(), "testdeploy");
        let topo = test_topology();
        let node = &topo.nodes()[0];

        let root = ca.ensure_root().unwrap();
        let leaf = ca.ensure_leaf(node).unwrap();

        let transport = Arc::new(MemoryTransport::new());
        let runner = HostRunner::new(transport.clone(), RetryPolicy::default());

        let outcome = ca.distribute(&runner, node, &leaf, &root).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(
            transport.upload_contents(&format!("{TRUST_DIR}/ca.crt")),
            Some(root.cert_pem.clone().into_bytes())
        );

        // Host now reports every artifact present.
        for name in ["ca.crt", "node-1.key", "node-1.crt"] {
            let check = RemoteCommand::new(["test", "-s", &format!("{TRUST_DIR}/{name}")]);
            transport.mark_satisfied(&check.rendered());
        }
        let outcome = ca.distribute(&runner, node, &leaf, &root).await.unwrap();
        assert_eq!(outcome, Outcome::AlreadySatisfied);
    }
}
