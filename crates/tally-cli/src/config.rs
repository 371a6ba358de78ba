use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_core::manifest::DomainManifest;
use tally_engine::{DeploymentConfig, DomainCatalog, StrategyKind};
use tally_storage::Warehouse;

pub const CONFIG_ENV: &str = "TALLY_CONFIG";
pub const CONFIG_FILE: &str = "tally.toml";
const DEFAULT_DATABASE: &str = "tally.db";

/// Contents of `tally.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TallyConfig {
    pub database: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
    pub hierarchy_table: Option<String>,
    pub default_strategy: StrategyKind,
    /// Per-domain strategy overrides, keyed by domain.
    pub strategies: BTreeMap<String, StrategyKind>,
    /// Extra `.toml`/`.json` manifests added on top of the built-in domains.
    pub manifests_dir: Option<PathBuf>,
}

/// A parsed config plus the directory relative paths resolve against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TallyConfig,
    pub source: Option<PathBuf>,
}

impl LoadedConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let user = dirs::config_dir().map(|dir| dir.join("tally").join(CONFIG_FILE));
        let source = locate(explicit, env_path, &cwd, user)?;
        let config = match &source {
            Some(path) => read_config(path)?,
            None => TallyConfig::default(),
        };
        Ok(Self { config, source })
    }

    fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    /// The `--database` flag wins over the file.
    pub fn database_path(&self, flag: Option<&Path>) -> PathBuf {
        match (flag, &self.config.database) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(path)) => self.resolve(path),
            (None, None) => PathBuf::from(DEFAULT_DATABASE),
        }
    }

    pub fn open_warehouse(&self, flag: Option<&Path>) -> Result<Warehouse> {
        let path = self.database_path(flag);
        let mut warehouse = Warehouse::open(&path)
            .with_context(|| format!("Failed to open warehouse {}", path.display()))?;
        if let Some(timeout) = self.config.busy_timeout_ms {
            warehouse
                .set_busy_timeout(Duration::from_millis(timeout))
                .context("Failed to set busy timeout")?;
        }
        if let Some(table) = &self.config.hierarchy_table {
            warehouse = warehouse
                .with_hierarchy_table(table.clone())
                .with_context(|| format!("Invalid hierarchy_table {table:?}"))?;
        }
        Ok(warehouse)
    }

    pub fn deployment(&self) -> DeploymentConfig {
        DeploymentConfig {
            default_strategy: self.config.default_strategy,
            overrides: self.config.strategies.clone(),
        }
    }

    /// Built-in domains plus any manifests found in `manifests_dir`.
    pub fn catalog(&self) -> Result<DomainCatalog> {
        let mut catalog = DomainCatalog::builtin();
        if let Some(dir) = &self.config.manifests_dir {
            for manifest in load_manifests(&self.resolve(dir))? {
                let key = manifest.key.clone();
                catalog
                    .insert(manifest)
                    .with_context(|| format!("Failed to register manifest {key}"))?;
            }
        }
        for key in self.config.strategies.keys() {
            if catalog.get(key).is_err() {
                bail!("[strategies] names unknown domain {key:?}");
            }
        }
        Ok(catalog)
    }
}

/// Lookup order: explicit flag, `TALLY_CONFIG`, `./tally.toml`, then the
/// user config directory. Only the last two may be absent.
fn locate(
    explicit: Option<&Path>,
    env_path: Option<PathBuf>,
    cwd: &Path,
    user: Option<PathBuf>,
) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("Config file {} does not exist", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }
    if let Some(path) = env_path {
        if !path.exists() {
            bail!("{CONFIG_ENV} points at missing file {}", path.display());
        }
        return Ok(Some(path));
    }
    let local = cwd.join(CONFIG_FILE);
    if local.exists() {
        return Ok(Some(local));
    }
    Ok(user.filter(|path| path.exists()))
}

fn read_config(path: &Path) -> Result<TallyConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Reads every `.toml` and `.json` manifest in `dir`, sorted by file name.
/// Manifests joining other extra manifests must sort after them.
pub fn load_manifests(dir: &Path) -> Result<Vec<DomainManifest>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read manifests_dir {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let extension = path.extension().and_then(|ext| ext.to_str());
        if matches!(extension, Some("toml") | Some("json")) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let manifest: DomainManifest = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse manifest {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse manifest {}", path.display()))?
        };
        manifests.push(manifest);
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_engine::domains::{growth_monitoring, GROWTH_MONITORING};
    use tempfile::tempdir;

    #[test]
    fn explicit_path_wins_and_must_exist() {
        let dir = tempdir().expect("tempdir");
        let explicit = dir.path().join("custom.toml");
        fs::write(&explicit, "").expect("write config");
        fs::write(dir.path().join(CONFIG_FILE), "").expect("write local config");

        let found = locate(Some(&explicit), None, dir.path(), None).expect("locate");
        assert_eq!(found, Some(explicit));

        let missing = dir.path().join("missing.toml");
        assert!(locate(Some(&missing), None, dir.path(), None).is_err());
    }

    #[test]
    fn env_path_beats_working_directory() {
        let dir = tempdir().expect("tempdir");
        let from_env = dir.path().join("env.toml");
        fs::write(&from_env, "").expect("write config");
        fs::write(dir.path().join(CONFIG_FILE), "").expect("write local config");

        let found = locate(None, Some(from_env.clone()), dir.path(), None).expect("locate");
        assert_eq!(found, Some(from_env));
    }

    #[test]
    fn falls_back_to_user_dir_then_defaults() {
        let cwd = tempdir().expect("cwd");
        let home = tempdir().expect("home");
        let user = home.path().join("tally").join(CONFIG_FILE);

        assert_eq!(
            locate(None, None, cwd.path(), Some(user.clone())).expect("locate"),
            None
        );
        fs::create_dir_all(user.parent().expect("parent")).expect("user dir");
        fs::write(&user, "").expect("write user config");
        assert_eq!(
            locate(None, None, cwd.path(), Some(user.clone())).expect("locate"),
            Some(user)
        );
    }

    #[test]
    fn parses_every_key() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
database = "warehouse.db"
busy_timeout_ms = 5000
hierarchy_table = "hierarchy_snapshot"
default_strategy = "distributed"
manifests_dir = "manifests"

[strategies]
growth-monitoring = "single-node"
"#,
        )
        .expect("write config");

        let config = read_config(&path).expect("parse");
        assert_eq!(config.busy_timeout_ms, Some(5000));
        assert_eq!(config.hierarchy_table.as_deref(), Some("hierarchy_snapshot"));
        assert_eq!(config.default_strategy, StrategyKind::Distributed);

        let loaded = LoadedConfig {
            config,
            source: Some(path),
        };
        assert_eq!(
            loaded.database_path(None),
            dir.path().join("warehouse.db")
        );
        assert_eq!(
            loaded.database_path(Some(Path::new("other.db"))),
            PathBuf::from("other.db")
        );
        let deployment = loaded.deployment();
        assert_eq!(deployment.strategy_for(GROWTH_MONITORING), StrategyKind::SingleNode);
        assert_eq!(deployment.strategy_for("facility-activity"), StrategyKind::Distributed);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "databse = \"typo.db\"\n").expect("write config");
        assert!(read_config(&path).is_err());
    }

    #[test]
    fn manifests_dir_overrides_builtin_domains() {
        let dir = tempdir().expect("tempdir");
        let manifests = dir.path().join("manifests");
        fs::create_dir_all(&manifests).expect("manifests dir");
        let mut manifest = growth_monitoring();
        manifest.description = "site specific".to_string();
        fs::write(
            manifests.join("growth.json"),
            serde_json::to_string_pretty(&manifest).expect("serialize"),
        )
        .expect("write manifest");
        fs::write(manifests.join("README.md"), "ignored").expect("write readme");

        let loaded = LoadedConfig {
            config: TallyConfig {
                manifests_dir: Some(PathBuf::from("manifests")),
                ..TallyConfig::default()
            },
            source: Some(dir.path().join(CONFIG_FILE)),
        };
        let catalog = loaded.catalog().expect("catalog");
        assert_eq!(
            catalog.get(GROWTH_MONITORING).expect("domain").description,
            "site specific"
        );
    }

    #[test]
    fn strategy_overrides_must_name_known_domains() {
        let mut strategies = BTreeMap::new();
        strategies.insert("no-such-domain".to_string(), StrategyKind::Distributed);
        let loaded = LoadedConfig {
            config: TallyConfig {
                strategies,
                ..TallyConfig::default()
            },
            source: None,
        };
        assert!(loaded.catalog().is_err());
    }

    #[test]
    fn busy_timeout_and_hierarchy_apply_to_the_warehouse() {
        let dir = tempdir().expect("tempdir");
        let loaded = LoadedConfig {
            config: TallyConfig {
                database: Some(PathBuf::from("file.db")),
                busy_timeout_ms: Some(250),
                hierarchy_table: Some("hierarchy_snapshot".to_string()),
                ..TallyConfig::default()
            },
            source: Some(dir.path().join(CONFIG_FILE)),
        };
        let warehouse = loaded.open_warehouse(None).expect("open");
        assert_eq!(warehouse.hierarchy_table(), "hierarchy_snapshot");
        assert!(dir.path().join("file.db").exists());
    }
}
