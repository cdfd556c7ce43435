//! Per-engine compute-device selection.
//!
//! Grammar: `engine[:cpu|:gpu[#N]][,engine…]` with a pseudo-engine
//! `all|any|a|*` that fans out to every registered engine. Device
//! numbers: −1 = CPU, 0 = default GPU, N ≥ 1 = explicit GPU.
//!
//! Three flags feed the same parser with different implicit-value
//! rules: `--cpu` hardcodes CPU (a device setting is an error),
//! `--gpu` fills in GPU 0 when no device is given, `--device` requires
//! an explicit device per engine.

use std::collections::BTreeMap;

use thiserror::Error;

/// CPU pseudo-device number.
pub const CPU_DEVICE: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DeviceConfigError(String);

/// How the flag's implicit device number interacts with per-engine
/// settings in the config string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplicitOverride {
    /// Implicit value is hardcoded; an explicit setting is an error.
    NotAllowed,
    /// Implicit value is the default when no setting is given.
    Allowed,
    /// No implicit value; every engine must name its device.
    Required,
}

#[derive(Debug, Clone)]
pub struct EngineDeviceConfig {
    /// canonical name → device number
    engines: BTreeMap<String, i32>,
    /// alias → canonical name (empty target = the `all` pseudo-engine)
    aliases: BTreeMap<String, String>,
}

impl Default for EngineDeviceConfig {
    fn default() -> Self {
        let mut aliases = BTreeMap::new();
        for alias in ["all", "any", "a", "*"] {
            aliases.insert(alias.to_string(), String::new());
        }
        Self {
            engines: BTreeMap::new(),
            aliases,
        }
    }
}

impl EngineDeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine under a canonical name plus aliases.
    pub fn add(&mut self, name: &str, default_device: i32, aliases: &[&str]) {
        self.engines.insert(name.to_string(), default_device);
        self.aliases.insert(name.to_string(), name.to_string());
        for alias in aliases {
            self.aliases.insert(alias.to_string(), name.to_string());
        }
    }

    pub fn device(&self, name: &str) -> Option<i32> {
        self.engines.get(name).copied()
    }

    pub fn is_gpu(&self, name: &str) -> bool {
        self.device(name).map(|d| d >= 0).unwrap_or(false)
    }

    /// `(name, device-string)` pairs for startup logging.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.engines
            .iter()
            .map(|(name, &device)| (name.clone(), device_string(device)))
            .collect()
    }

    /// Apply one config string under the given implicit-value rules.
    pub fn apply(
        &mut self,
        config: &str,
        implicit_device: i32,
        mode: ImplicitOverride,
    ) -> Result<(), DeviceConfigError> {
        for engine_config in config.to_ascii_lowercase().split(',') {
            if engine_config.is_empty() {
                continue;
            }
            let parts: Vec<&str> = engine_config.split(':').collect();
            if parts.len() > 3 {
                return Err(DeviceConfigError(format!(
                    "invalid engine device setting {engine_config}"
                )));
            }

            let engine = self.resolve(parts[0])?;

            let device = match parts.len() {
                1 => {
                    if mode == ImplicitOverride::Required {
                        return Err(DeviceConfigError(format!(
                            "missing device for engine {}",
                            engine_name(&engine)
                        )));
                    }
                    implicit_device
                }
                2 => {
                    if mode == ImplicitOverride::NotAllowed {
                        return Err(DeviceConfigError(format!(
                            "device setting not allowed (hardcoded to {implicit_device}) for engine {}",
                            engine_name(&engine)
                        )));
                    }
                    parse_device_setting(parts[1], &engine)?
                }
                3 => parse_typed_device(parts[1], parts[2], &engine)?,
                _ => unreachable!("split yields at least one part"),
            };

            self.set(&engine, device);
        }
        Ok(())
    }

    /// Resolve an alias to a canonical engine name; empty = all.
    fn resolve(&self, alias: &str) -> Result<String, DeviceConfigError> {
        self.aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| DeviceConfigError(format!("engine {alias} was not recognized")))
    }

    fn set(&mut self, engine: &str, device: i32) {
        if engine.is_empty() {
            for value in self.engines.values_mut() {
                *value = device;
            }
        } else if let Some(value) = self.engines.get_mut(engine) {
            *value = device;
        }
    }
}

fn engine_name(engine: &str) -> &str {
    if engine.is_empty() {
        "all"
    } else {
        engine
    }
}

fn device_string(device: i32) -> String {
    if device == CPU_DEVICE {
        "cpu".to_string()
    } else {
        format!("gpu#{device}")
    }
}

/// `cpu`, `gpu`, `gpu#N`, or a bare device number.
fn parse_device_setting(setting: &str, engine: &str) -> Result<i32, DeviceConfigError> {
    match setting.split_once('#') {
        Some((kind, number)) => parse_typed_device(kind, number, engine),
        None => match setting {
            "cpu" => Ok(CPU_DEVICE),
            "gpu" => Ok(0),
            number => number
                .parse::<i32>()
                .map(|device| if device < 0 { CPU_DEVICE } else { device })
                .map_err(|_| {
                    DeviceConfigError(format!(
                        "invalid device setting for engine {}: {setting}",
                        engine_name(engine)
                    ))
                }),
        },
    }
}

/// `gpu` + device number, where the number may be one of the
/// `*|auto|default|any` aliases for 0.
fn parse_typed_device(kind: &str, number: &str, engine: &str) -> Result<i32, DeviceConfigError> {
    match kind {
        "cpu" => Err(DeviceConfigError(format!(
            "CPU device does not take device number for engine {}",
            engine_name(engine)
        ))),
        "gpu" => {
            if matches!(number, "*" | "default" | "any" | "auto") {
                return Ok(0);
            }
            let device = number.parse::<i32>().map_err(|_| {
                DeviceConfigError(format!(
                    "invalid GPU device number for engine {}: {number}",
                    engine_name(engine)
                ))
            })?;
            if device < 0 {
                return Err(DeviceConfigError(format!(
                    "invalid GPU device number for engine {}: {number}",
                    engine_name(engine)
                )));
            }
            Ok(device)
        }
        _ => Err(DeviceConfigError(format!(
            "unknown device type for engine {}: {kind}",
            engine_name(engine)
        ))),
    }
}
