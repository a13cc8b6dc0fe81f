use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_TEMPERATURE_K: u32 = 300;
pub const DEFAULT_TIMESTEP_FS: f64 = 2.0;
pub const DEFAULT_PH: f64 = 7.0;

pub const SUPPORTED_INTEGRATORS: &[&str] = &[
    "langevin",
    "langevin_middle",
    "brownian",
    "verlet",
    "variable_langevin",
    "variable_verlet",
];

/// A temperature in kelvin that remembers how it was written, so `300`
/// labels a run as `T300` and `300.0` as `T300.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Temperature(serde_json::Number);

impl Temperature {
    pub fn kelvin(&self) -> f64 {
        self.0.as_f64().unwrap_or(f64::NAN)
    }

    pub fn from_kelvin(value: f64) -> Option<Self> {
        serde_json::Number::from_f64(value).map(Temperature)
    }
}

impl From<u32> for Temperature {
    fn from(value: u32) -> Self {
        Temperature(serde_json::Number::from(value))
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct Forcefields(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Forcefields {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => Forcefields(vec![s]),
            OneOrMany::Many(v) => Forcefields(v),
        }
    }
}

impl Forcefields {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntegratorSpec {
    Named(String),
    Detailed(IntegratorBlock),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratorBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestep_fs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friction_ps: Option<f64>,
    #[serde(
        rename = "temperature_K",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature_k: Option<Temperature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_tolerance: Option<f64>,
}

impl IntegratorSpec {
    pub fn name(&self) -> String {
        match self {
            IntegratorSpec::Named(name) => name.trim().to_lowercase(),
            IntegratorSpec::Detailed(block) => block
                .name
                .as_deref()
                .unwrap_or("langevin")
                .trim()
                .to_lowercase(),
        }
    }

    fn layered(&self, over: &IntegratorSpec) -> IntegratorSpec {
        match (self, over) {
            (IntegratorSpec::Detailed(base), IntegratorSpec::Detailed(top)) => {
                IntegratorSpec::Detailed(IntegratorBlock {
                    name: layer(&base.name, &top.name),
                    timestep_fs: layer(&base.timestep_fs, &top.timestep_fs),
                    friction_ps: layer(&base.friction_ps, &top.friction_ps),
                    temperature_k: layer(&base.temperature_k, &top.temperature_k),
                    error_tolerance: layer(&base.error_tolerance, &top.error_tolerance),
                })
            }
            _ => over.clone(),
        }
    }
}

/// Global simulation knobs. Every field is optional so the same type can
/// serve as a base layer or as an override layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_properties: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
    #[serde(
        rename = "temperature_K",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature_k: Option<Temperature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_atm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestep_fs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friction_ps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrator: Option<IntegratorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forcefield: Option<Forcefields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ionic_strength_molar: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neutralize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_padding_nm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimize_tolerance_kjmol_per_nm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimize_max_iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_system: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_style: Option<String>,
    /// Engine-specific knobs passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Defaults {
    pub fn temperature(&self) -> Temperature {
        self.temperature_k
            .clone()
            .unwrap_or_else(|| Temperature::from(DEFAULT_TEMPERATURE_K))
    }

    pub fn timestep_fs(&self) -> f64 {
        self.timestep_fs.unwrap_or(DEFAULT_TIMESTEP_FS)
    }

    /// Returns a new layer where every field set in `over` wins. Nested maps
    /// are merged key by key; lists and scalars are replaced.
    pub fn layered(&self, over: &Defaults) -> Defaults {
        Defaults {
            engine: layer(&self.engine, &over.engine),
            platform: layer(&self.platform, &over.platform),
            platform_properties: layer_map(&self.platform_properties, &over.platform_properties),
            ph: layer(&self.ph, &over.ph),
            temperature_k: layer(&self.temperature_k, &over.temperature_k),
            pressure_atm: layer(&self.pressure_atm, &over.pressure_atm),
            timestep_fs: layer(&self.timestep_fs, &over.timestep_fs),
            friction_ps: layer(&self.friction_ps, &over.friction_ps),
            constraints: layer(&self.constraints, &over.constraints),
            integrator: match (&self.integrator, &over.integrator) {
                (Some(base), Some(top)) => Some(base.layered(top)),
                (base, top) => layer(base, top),
            },
            forcefield: layer(&self.forcefield, &over.forcefield),
            ionic_strength_molar: layer(&self.ionic_strength_molar, &over.ionic_strength_molar),
            neutralize: layer(&self.neutralize, &over.neutralize),
            ions: layer(&self.ions, &over.ions),
            box_padding_nm: layer(&self.box_padding_nm, &over.box_padding_nm),
            minimize_tolerance_kjmol_per_nm: layer(
                &self.minimize_tolerance_kjmol_per_nm,
                &over.minimize_tolerance_kjmol_per_nm,
            ),
            minimize_max_iterations: layer(
                &self.minimize_max_iterations,
                &over.minimize_max_iterations,
            ),
            report_interval: layer(&self.report_interval, &over.report_interval),
            checkpoint_interval: layer(&self.checkpoint_interval, &over.checkpoint_interval),
            create_system: layer_map(&self.create_system, &over.create_system),
            log_style: layer(&self.log_style, &over.log_style),
            extra: merge_maps(&self.extra, &over.extra),
        }
    }
}

fn layer<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
    over.clone().or_else(|| base.clone())
}

fn layer_map(
    base: &Option<BTreeMap<String, Value>>,
    over: &Option<BTreeMap<String, Value>>,
) -> Option<BTreeMap<String, Value>> {
    match (base, over) {
        (Some(b), Some(o)) => Some(merge_maps(b, o)),
        _ => layer(base, over),
    }
}

fn merge_maps(base: &BTreeMap<String, Value>, over: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut out = base.clone();
    for (key, value) in over {
        let merged = match out.get(key) {
            Some(existing) => merge_values(existing, value),
            None => value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

fn merge_values(base: &Value, over: &Value) -> Value {
    match (base, over) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (key, value) in o {
                let merged = match out.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => over.clone(),
    }
}
