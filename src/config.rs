use crate::errors::{AppError, AppResult};
use crate::models::EmptyCell;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

pub const DEFAULT_MAX_ROWS: usize = 1000;
const DEFAULT_DB_PATH: &str = "cardq.sqlite";
const DEFAULT_LOG_FILTER: &str = "info";

/// Row cap and card allowlist applied by the query guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    pub max_rows: usize,
    pub allowlist_enabled: bool,
    pub allowed_ids: BTreeSet<String>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            allowlist_enabled: false,
            allowed_ids: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub guard: GuardSettings,
    pub empty_cell: EmptyCell,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            guard: GuardSettings::default(),
            empty_cell: EmptyCell::Zero,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Reads `CARDQ_CONFIG_PATH` (if set) and overlays the process
    /// environment on top of it.
    pub fn load() -> AppResult<Self> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("CARDQ_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> AppResult<Self> {
        let max_rows = parse_usize(kv.get("CARDQ_MAX_ROWS"), DEFAULT_MAX_ROWS, "CARDQ_MAX_ROWS")?;
        if max_rows == 0 {
            return Err(AppError::Startup("CARDQ_MAX_ROWS must be >= 1".to_string()));
        }

        let allowlist_enabled =
            parse_bool(kv.get("CARDQ_ALLOWLIST_ENABLED"), false, "CARDQ_ALLOWLIST_ENABLED")?;
        let allowed_ids = kv
            .get("CARDQ_ALLOWED_CARD_IDS")
            .map(|raw| parse_id_list(raw))
            .unwrap_or_default();

        let empty_cell = match non_blank(kv.get("CARDQ_EMPTY_CELL")) {
            None => EmptyCell::Zero,
            Some(raw) => EmptyCell::parse(raw).ok_or_else(|| {
                AppError::Startup("CARDQ_EMPTY_CELL must be 'zero' or 'null'".to_string())
            })?,
        };

        let db_path = PathBuf::from(non_blank(kv.get("CARDQ_DB_PATH")).unwrap_or(DEFAULT_DB_PATH));
        let log_dir = non_blank(kv.get("CARDQ_LOG_DIR")).map(PathBuf::from);
        let log_filter = non_blank(kv.get("CARDQ_LOG_FILTER"))
            .unwrap_or(DEFAULT_LOG_FILTER)
            .to_string();

        Ok(Self {
            guard: GuardSettings {
                max_rows,
                allowlist_enabled,
                allowed_ids,
            },
            empty_cell,
            db_path,
            log_dir,
            log_filter,
        })
    }
}

fn parse_env_file(path: &str) -> AppResult<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| AppError::Startup(format!("failed to read config file at {}: {}", path, err)))?;

    let mut kv = HashMap::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            AppError::Startup(format!("invalid config line {} (expected KEY=VALUE)", idx + 1))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::Startup(format!("invalid config line {} (empty key)", idx + 1)));
        }

        let value = value.trim().trim_matches('"');
        kv.insert(key.to_string(), value.to_string());
    }

    Ok(kv)
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_usize(value: Option<&String>, default: usize, key: &str) -> AppResult<usize> {
    match non_blank(value) {
        None => Ok(default),
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| AppError::Startup(format!("{} must be a non-negative integer", key))),
    }
}

fn parse_bool(value: Option<&String>, default: bool, key: &str) -> AppResult<bool> {
    let Some(value) = non_blank(value) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Startup(format!("{} must be a boolean", key))),
    }
}

fn parse_id_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .collect()
}
