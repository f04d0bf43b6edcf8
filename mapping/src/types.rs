use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type ProjectId = String;
pub type CompanyId = String;
pub type ConfigId = String;

/// Opaque payload delivered to clients.
pub type Params = Map<String, Value>;

/// Raw per-dimension tokens supplied by an admin: empty, `ALL`, or a
/// comma/space separated list of literal values.
pub type FilterRequest = BTreeMap<String, String>;

pub const APP_CONFIG_TYPE: &str = "app";
pub const PLAYER_CONFIG_TYPE: &str = "player";

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Inactive,
}

impl Status {
    pub fn is_active(self) -> bool {
        self == Status::Active
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDimension {
    pub name: String,
    pub priority: i64,
    pub values: Vec<String>,
    /// Empty means the dimension may be left unset.
    #[serde(default)]
    pub default: String,
}

impl FilterDimension {
    pub fn new<N, I, V, D>(name: N, priority: i64, values: I, default: D) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
        D: Into<String>,
    {
        let mut dimension = FilterDimension {
            name: name.into(),
            priority,
            values: values.into_iter().map(Into::into).collect(),
            default: default.into(),
        };
        dimension.dedup_values();
        dimension
    }

    /// Drops repeated values, keeping the first occurrence.
    pub fn dedup_values(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.values.retain(|v| seen.insert(v.clone()));
    }

    pub fn has_value(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// One concrete value for every dimension of a project. Keyed by dimension
/// name so equality does not depend on insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterCombination(BTreeMap<String, String>);

impl FilterCombination {
    pub fn new() -> Self {
        FilterCombination(BTreeMap::new())
    }

    pub fn insert<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable textual form, names sorted: `COUNTRY=IN,SUBSCRIPTION=FREE`.
    /// Backslashes, `,` and `=` inside names and values are backslash-escaped, so
    /// distinct combinations never share a key.
    pub fn canonical_key(&self) -> String {
        self.iter()
            .map(|(name, value)| {
                format!("{}={}", escape_key_part(name), escape_key_part(value))
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, '\\' | ',' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl<N, V> FromIterator<(N, V)> for FilterCombination
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        FilterCombination(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// Which slot of a mapping a bundle occupies. Set once at creation and used
/// for all dispatch; the config id prefix is never inspected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConfigKind {
    App,
    Player,
    /// A project-declared config type, e.g. `banner`.
    Custom(String),
}

impl ConfigKind {
    /// Name of the config type as declared on the project.
    pub fn type_name(&self) -> &str {
        match self {
            ConfigKind::App => APP_CONFIG_TYPE,
            ConfigKind::Player => PLAYER_CONFIG_TYPE,
            ConfigKind::Custom(name) => name,
        }
    }

    /// Seed prefix for generated config ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ConfigKind::App => "AC",
            ConfigKind::Player => "PC",
            ConfigKind::Custom(_) => "CC",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("config type name cannot be empty")]
pub struct EmptyConfigType;

impl TryFrom<String> for ConfigKind {
    type Error = EmptyConfigType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        match value {
            "" => Err(EmptyConfigType),
            APP_CONFIG_TYPE => Ok(ConfigKind::App),
            PLAYER_CONFIG_TYPE => Ok(ConfigKind::Player),
            other => Ok(ConfigKind::Custom(other.to_string())),
        }
    }
}

impl From<ConfigKind> for String {
    fn from(kind: ConfigKind) -> Self {
        kind.type_name().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub config_id: ConfigId,
    pub project_id: ProjectId,
    pub company_id: CompanyId,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub kind: ConfigKind,
    pub params: Params,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl ConfigBundle {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            config_id: self.config_id.clone(),
            name: self.name.clone(),
            desc: self.desc.clone(),
            params: self.params.clone(),
        }
    }
}

/// Copy of a bundle embedded in a mapping so resolution needs no join.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config_id: ConfigId,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub params: Params,
}

impl ConfigSnapshot {
    pub fn app_default() -> Self {
        ConfigSnapshot {
            config_id: "ac_default".into(),
            ..Default::default()
        }
    }

    pub fn player_default() -> Self {
        ConfigSnapshot {
            config_id: "pc_default".into(),
            ..Default::default()
        }
    }
}

/// The snapshots a mapping carries, one slot per config kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleSnapshots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_config: Option<ConfigSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_config: Option<ConfigSnapshot>,
    #[serde(default)]
    pub custom_config: BTreeMap<String, ConfigSnapshot>,
}

impl BundleSnapshots {
    pub fn slot(&self, kind: &ConfigKind) -> Option<&ConfigSnapshot> {
        match kind {
            ConfigKind::App => self.app_config.as_ref(),
            ConfigKind::Player => self.player_config.as_ref(),
            ConfigKind::Custom(name) => self.custom_config.get(name),
        }
    }

    pub fn slot_mut(&mut self, kind: &ConfigKind) -> Option<&mut ConfigSnapshot> {
        match kind {
            ConfigKind::App => self.app_config.as_mut(),
            ConfigKind::Player => self.player_config.as_mut(),
            ConfigKind::Custom(name) => self.custom_config.get_mut(name),
        }
    }

    pub fn set(&mut self, kind: &ConfigKind, snapshot: ConfigSnapshot) {
        match kind {
            ConfigKind::App => self.app_config = Some(snapshot),
            ConfigKind::Player => self.player_config = Some(snapshot),
            ConfigKind::Custom(name) => {
                self.custom_config.insert(name.clone(), snapshot);
            }
        }
    }

    /// True if the slot for `kind` holds the bundle `config_id`.
    pub fn embeds(&self, kind: &ConfigKind, config_id: &str) -> bool {
        self.slot(kind).is_some_and(|s| s.config_id == config_id)
    }

    pub fn is_empty(&self) -> bool {
        self.app_config.is_none() && self.player_config.is_none() && self.custom_config.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterEntry {
    pub project_id: ProjectId,
    pub company_id: CompanyId,
    pub filter: FilterCombination,
    #[serde(flatten)]
    pub bundles: BundleSnapshots,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl MasterEntry {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectEnv {
    #[default]
    Prod,
    Uat,
    Dev,
    Test,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigType {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub status: Status,
}

impl ConfigType {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, desc: D) -> Self {
        ConfigType {
            name: name.into(),
            desc: desc.into(),
            status: Status::Active,
        }
    }

    pub fn builtin() -> Vec<ConfigType> {
        vec![
            ConfigType::new(APP_CONFIG_TYPE, "Main Application Configuration"),
            ConfigType::new(PLAYER_CONFIG_TYPE, "Main Player Configuration"),
        ]
    }
}

/// Project roles, ordered by privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Owner => "owner",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: ProjectId,
    pub company_id: CompanyId,
    pub name: String,
    #[serde(default)]
    pub env: ProjectEnv,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub editors: Vec<String>,
    #[serde(default)]
    pub viewers: Vec<String>,
    #[serde(default = "ConfigType::builtin")]
    pub config_types: Vec<ConfigType>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Project {
    /// Highest role held by `email`, if any.
    pub fn role_of(&self, email: &str) -> Option<Role> {
        let holds = |list: &[String]| list.iter().any(|member| member == email);

        if holds(&self.owners) {
            Some(Role::Owner)
        } else if holds(&self.editors) {
            Some(Role::Editor)
        } else if holds(&self.viewers) {
            Some(Role::Viewer)
        } else {
            None
        }
    }

    pub fn has_active_config_type(&self, name: &str) -> bool {
        self.config_types
            .iter()
            .any(|t| t.name == name && t.status.is_active())
    }

    pub fn members_mut(&mut self, role: Role) -> &mut Vec<String> {
        match role {
            Role::Owner => &mut self.owners,
            Role::Editor => &mut self.editors,
            Role::Viewer => &mut self.viewers,
        }
    }
}

/// The authenticated identity making a request, as supplied by the session
/// gateway in front of this service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub email: String,
}

impl Caller {
    pub fn new<E: Into<String>>(email: E) -> Self {
        Caller {
            email: email.into(),
        }
    }
}
