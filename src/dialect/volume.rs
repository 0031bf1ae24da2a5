//! Volume mount declarations
//!
//! ```text
//! mount  := body [":ro" | ":rw"]
//! body   := scheme "://" source ":" path     typed volume
//!         | host ":" path                     untyped hostPath
//!         | path                              emptyDir
//! scheme := file | dir | nfs | config | secret | pvc | downwardAPI
//! ```
//!
//! For `config`, `secret` and `pvc` the source is `[name] "/" [key]`: the
//! name defaults to the app's own resource and a key projects a single entry
//! through `subPath`. A source without `/` is entirely the key. `nfs` sources
//! are `server "/" path`.
//!
//! The volume identity is the fingerprint of everything before the final
//! `:path`, so two containers mounting the same source share one volume.

use std::collections::BTreeSet;

use aws_lc_rs::digest::{digest, SHA256};
use serde_json::Value;

use crate::context::{config_map_name, secret_name};
use crate::k8s::{
    ConfigMapVolumeSource, DownwardApiVolumeFile, DownwardApiVolumeSource, EmptyDirVolumeSource,
    HostPathVolumeSource, KeyToPath, NfsVolumeSource, ObjectFieldSelector, PvcVolumeSource,
    SecretVolumeSource, VolumeMount, VolumeSource,
};
use crate::{Error, Result};

/// Pod fields projected when a downward API mount names none
const DEFAULT_DOWNWARD_FIELDS: &[&str] = &["labels", "annotations"];

/// Backing source of a deduplicated volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeSpec {
    /// Scratch directory
    EmptyDir,
    /// Host file, created when missing
    HostFile {
        /// Path on the node
        path: String,
    },
    /// Host directory, created when missing
    HostDir {
        /// Path on the node
        path: String,
    },
    /// Host path of unspecified type
    HostPath {
        /// Path on the node
        path: String,
    },
    /// NFS export
    Nfs {
        /// Server address
        server: String,
        /// Exported path
        path: String,
    },
    /// ConfigMap projection
    ConfigMap {
        /// ConfigMap name
        name: String,
        /// Single projected key
        key: Option<String>,
    },
    /// Secret projection
    Secret {
        /// Secret name
        name: String,
        /// Single projected key
        key: Option<String>,
    },
    /// Pod metadata projection
    DownwardApi {
        /// Single metadata field, e.g. `labels`
        field: Option<String>,
    },
    /// Persistent volume claim
    Pvc {
        /// Claim name
        claim: String,
    },
}

impl VolumeSpec {
    /// Render the Kubernetes volume source
    ///
    /// Whole-map projections of the app's own ConfigMap or Secret default
    /// their items to the keys that came from files.
    pub fn to_source(
        &self,
        app: &str,
        config_file_keys: &BTreeSet<String>,
        secret_file_keys: &BTreeSet<String>,
    ) -> VolumeSource {
        match self {
            Self::EmptyDir => VolumeSource::EmptyDir(EmptyDirVolumeSource {}),
            Self::HostFile { path } => host_path(path, Some("FileOrCreate")),
            Self::HostDir { path } => host_path(path, Some("DirectoryOrCreate")),
            Self::HostPath { path } => host_path(path, None),
            Self::Nfs { server, path } => VolumeSource::Nfs(NfsVolumeSource {
                server: server.clone(),
                path: path.clone(),
            }),
            Self::ConfigMap { name, key } => {
                let own = *name == config_map_name(app);
                VolumeSource::ConfigMap(ConfigMapVolumeSource {
                    name: name.clone(),
                    items: projected_items(key.as_deref(), own, config_file_keys),
                })
            }
            Self::Secret { name, key } => {
                let own = *name == secret_name(app);
                VolumeSource::Secret(SecretVolumeSource {
                    secret_name: name.clone(),
                    items: projected_items(key.as_deref(), own, secret_file_keys),
                })
            }
            Self::DownwardApi { field } => {
                let fields: Vec<&str> = match field {
                    Some(field) => vec![field.as_str()],
                    None => DEFAULT_DOWNWARD_FIELDS.to_vec(),
                };
                VolumeSource::DownwardApi(DownwardApiVolumeSource {
                    items: fields
                        .into_iter()
                        .map(|field| DownwardApiVolumeFile {
                            path: field.to_string(),
                            field_ref: ObjectFieldSelector {
                                field_path: format!("metadata.{}", field),
                            },
                        })
                        .collect(),
                })
            }
            Self::Pvc { claim } => VolumeSource::PersistentVolumeClaim(PvcVolumeSource {
                claim_name: claim.clone(),
            }),
        }
    }
}

fn host_path(path: &str, type_: Option<&str>) -> VolumeSource {
    VolumeSource::HostPath(HostPathVolumeSource {
        path: path.to_string(),
        type_: type_.map(str::to_string),
    })
}

fn projected_items(key: Option<&str>, own: bool, file_keys: &BTreeSet<String>) -> Vec<KeyToPath> {
    if key.is_some() || !own {
        return Vec::new();
    }
    file_keys
        .iter()
        .map(|key| KeyToPath {
            key: key.clone(),
            path: key.clone(),
        })
        .collect()
}

/// One parsed mount line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMount {
    /// Fingerprint of the volume identity
    pub fingerprint: String,
    /// Backing volume
    pub volume: VolumeSpec,
    /// Path inside the container
    pub mount_path: String,
    /// Key or sub directory mounted instead of the whole volume
    pub sub_path: Option<String>,
    /// Mounted read only
    pub read_only: bool,
}

impl ParsedMount {
    /// Volume name derived from the fingerprint
    pub fn volume_name(&self) -> String {
        format!("vol-{}", self.fingerprint)
    }

    /// Container volume mount
    pub fn to_volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name(),
            mount_path: self.mount_path.clone(),
            sub_path: self.sub_path.clone(),
            read_only: self.read_only.then_some(true),
        }
    }
}

/// Stable short hash of a volume identity
pub fn fingerprint(identity: &str) -> String {
    let hash = digest(&SHA256, identity.as_bytes());
    hash.as_ref()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Split a `volumes` argument into mount lines
pub fn mount_lines(value: &Value) -> Result<Vec<String>> {
    super::lines(value, "volumes")
}

/// Parse one mount line for the given app
pub fn parse_mount(input: &str, app: &str) -> Result<ParsedMount> {
    let trimmed = input.trim();
    let (body, read_only) = if let Some(body) = trimmed.strip_suffix(":ro") {
        (body, true)
    } else if let Some(body) = trimmed.strip_suffix(":rw") {
        (body, false)
    } else {
        (trimmed, false)
    };

    if body.is_empty() {
        return Err(Error::malformed_mount(input, "empty declaration"));
    }

    let (identity, mount_path, volume, sub_path) = match body.split_once("://") {
        Some((scheme, rest)) => {
            let (source, mount_path) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::malformed_mount(input, "missing mount path"))?;
            let (volume, sub_path) = typed_volume(input, scheme, source, app)?;
            (&body[..body.len() - mount_path.len() - 1], mount_path, volume, sub_path)
        }
        None => match body.split_once(':') {
            Some((host, mount_path)) => {
                if host.is_empty() {
                    return Err(Error::malformed_mount(input, "empty host path"));
                }
                let volume = VolumeSpec::HostPath {
                    path: host.to_string(),
                };
                (host, mount_path, volume, None)
            }
            None => (body, body, VolumeSpec::EmptyDir, None),
        },
    };

    if mount_path.is_empty() {
        return Err(Error::malformed_mount(input, "empty mount path"));
    }

    Ok(ParsedMount {
        fingerprint: fingerprint(identity),
        volume,
        mount_path: mount_path.to_string(),
        sub_path,
        read_only,
    })
}

/// Map a scheme and its source to a volume plus optional sub path
fn typed_volume(
    input: &str,
    scheme: &str,
    source: &str,
    app: &str,
) -> Result<(VolumeSpec, Option<String>)> {
    let require_path = |what: &str| -> Result<String> {
        if source.is_empty() {
            Err(Error::malformed_mount(input, format!("missing {}", what)))
        } else {
            Ok(source.to_string())
        }
    };

    match scheme {
        "file" => Ok((VolumeSpec::HostFile { path: require_path("host file")? }, None)),
        "dir" => Ok((VolumeSpec::HostDir { path: require_path("host directory")? }, None)),
        "nfs" => {
            let (server, path) = source
                .split_once('/')
                .ok_or_else(|| Error::malformed_mount(input, "nfs source must be server/path"))?;
            if server.is_empty() {
                return Err(Error::malformed_mount(input, "missing nfs server"));
            }
            Ok((
                VolumeSpec::Nfs {
                    server: server.to_string(),
                    path: format!("/{}", path),
                },
                None,
            ))
        }
        "config" => {
            let (name, key) = split_projection(source);
            let name = name.unwrap_or_else(|| config_map_name(app));
            Ok((VolumeSpec::ConfigMap { name, key: key.clone() }, key))
        }
        "secret" => {
            let (name, key) = split_projection(source);
            let name = name.unwrap_or_else(|| secret_name(app));
            Ok((VolumeSpec::Secret { name, key: key.clone() }, key))
        }
        "pvc" => {
            let (name, key) = split_projection(source);
            let claim = name.unwrap_or_else(|| app.to_string());
            Ok((VolumeSpec::Pvc { claim }, key))
        }
        "downwardAPI" => {
            let field = source.trim_matches('/');
            let field = (!field.is_empty()).then(|| field.to_string());
            Ok((VolumeSpec::DownwardApi { field: field.clone() }, field))
        }
        other => Err(Error::UnsupportedVolumeProtocol(other.to_string())),
    }
}

/// Split `[name] "/" [key]`; a source with no `/` is only a key
fn split_projection(source: &str) -> (Option<String>, Option<String>) {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    match source.split_once('/') {
        Some((name, key)) => (non_empty(name), non_empty(key)),
        None => (None, non_empty(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> ParsedMount {
        parse_mount(input, "web").unwrap()
    }

    // =========================================================================
    // Story: Typed Host Volumes
    // =========================================================================

    #[test]
    fn story_file_and_dir_map_to_typed_host_paths() {
        let mount = parse("file:///var/run/docker.sock:/var/run/docker.sock:ro");
        assert_eq!(
            mount.volume,
            VolumeSpec::HostFile {
                path: "/var/run/docker.sock".to_string()
            }
        );
        assert!(mount.read_only);
        assert_eq!(mount.mount_path, "/var/run/docker.sock");

        let mount = parse("dir:///apps/etc/php-fpm/:/usr/local/etc/php-fpm.d/:rw");
        assert_eq!(
            mount.volume,
            VolumeSpec::HostDir {
                path: "/apps/etc/php-fpm/".to_string()
            }
        );
        assert!(!mount.read_only);
    }

    #[test]
    fn story_nfs_splits_server_and_path() {
        let mount = parse("nfs://192.168.159.14/data:/mnt");
        assert_eq!(
            mount.volume,
            VolumeSpec::Nfs {
                server: "192.168.159.14".to_string(),
                path: "/data".to_string()
            }
        );
    }

    // =========================================================================
    // Story: Implicit Volumes
    // =========================================================================

    #[test]
    fn story_host_colon_mount_is_untyped_host_path() {
        let mount = parse("/mycfg:/etc/mycfg");
        assert_eq!(
            mount.volume,
            VolumeSpec::HostPath {
                path: "/mycfg".to_string()
            }
        );
        assert_eq!(mount.fingerprint, fingerprint("/mycfg"));
    }

    #[test]
    fn story_bare_path_is_empty_dir() {
        let mount = parse("/cache");
        assert_eq!(mount.volume, VolumeSpec::EmptyDir);
        assert_eq!(mount.mount_path, "/cache");
        assert_eq!(mount.fingerprint, fingerprint("/cache"));
    }

    // =========================================================================
    // Story: Projected Maps
    // =========================================================================

    #[test]
    fn story_config_defaults_to_app_map() {
        let mount = parse("config://:/etc/nginx/conf.d");
        assert_eq!(
            mount.volume,
            VolumeSpec::ConfigMap {
                name: "web-config".to_string(),
                key: None
            }
        );
        assert_eq!(mount.sub_path, None);
    }

    #[test]
    fn story_config_key_sets_sub_path() {
        let mount = parse("config://nginx.conf:/etc/nginx/nginx.conf");
        assert_eq!(mount.sub_path.as_deref(), Some("nginx.conf"));
        assert!(matches!(
            &mount.volume,
            VolumeSpec::ConfigMap { name, .. } if name == "web-config"
        ));

        let mount = parse("secret://tls/cert.pem:/etc/tls/cert.pem:ro");
        assert_eq!(
            mount.volume,
            VolumeSpec::Secret {
                name: "tls".to_string(),
                key: Some("cert.pem".to_string())
            }
        );
        assert_eq!(mount.sub_path.as_deref(), Some("cert.pem"));
        assert_eq!(mount.to_volume_mount().read_only, Some(true));
    }

    #[test]
    fn story_pvc_defaults_claim_to_app() {
        let mount = parse("pvc://:/var/lib/data");
        assert_eq!(
            mount.volume,
            VolumeSpec::Pvc {
                claim: "web".to_string()
            }
        );

        let mount = parse("pvc://shared/logs:/var/log/app");
        assert_eq!(
            mount.volume,
            VolumeSpec::Pvc {
                claim: "shared".to_string()
            }
        );
        assert_eq!(mount.sub_path.as_deref(), Some("logs"));
    }

    #[test]
    fn story_whole_own_map_defaults_items_to_file_keys() {
        let mut files = BTreeSet::new();
        files.insert("nginx.conf".to_string());
        let none = BTreeSet::new();

        let own = parse("config://:/etc/nginx").volume;
        match own.to_source("web", &files, &none) {
            VolumeSource::ConfigMap(cm) => {
                assert_eq!(cm.items.len(), 1);
                assert_eq!(cm.items[0].key, "nginx.conf");
            }
            other => panic!("expected configMap, got {:?}", other),
        }

        let foreign = parse("config://shared/:/etc/shared").volume;
        match foreign.to_source("web", &files, &none) {
            VolumeSource::ConfigMap(cm) => assert!(cm.items.is_empty()),
            other => panic!("expected configMap, got {:?}", other),
        }
    }

    #[test]
    fn story_downward_api_defaults_to_labels_and_annotations() {
        let none = BTreeSet::new();
        match parse("downwardAPI://:/etc/podinfo").volume.to_source("web", &none, &none) {
            VolumeSource::DownwardApi(api) => {
                let paths: Vec<_> = api.items.iter().map(|i| i.path.as_str()).collect();
                assert_eq!(paths, vec!["labels", "annotations"]);
            }
            other => panic!("expected downwardAPI, got {:?}", other),
        }
    }

    // =========================================================================
    // Story: Fingerprints Identify Volumes
    // =========================================================================

    #[test]
    fn story_same_source_same_fingerprint() {
        let a = parse("dir:///data:/data");
        let b = parse("dir:///data:/mnt/other:ro");
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.volume_name(), b.volume_name());
        assert!(a.volume_name().starts_with("vol-"));
        assert_eq!(a.fingerprint.len(), 16);

        let c = parse("dir:///other:/data");
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    // =========================================================================
    // Story: Malformed Mounts
    // =========================================================================

    #[test]
    fn story_unsupported_protocol_rejected() {
        let err = parse_mount("s3://bucket/key:/data", "web").unwrap_err();
        assert!(matches!(err, Error::UnsupportedVolumeProtocol(p) if p == "s3"));
    }

    #[test]
    fn story_malformed_mounts_rejected() {
        for bad in ["", ":ro", "nfs://nopath:/mnt", "nfs:///data:/mnt", "file://:/x", "dir:///data", "/a:"] {
            let err = parse_mount(bad, "web").unwrap_err();
            assert!(
                matches!(err, Error::MalformedMount { .. }),
                "expected MalformedMount for {:?}, got {:?}",
                bad,
                err
            );
        }
    }
}
