use crate::cloning::{DriverSettings, FacetFilter, FacetKind, FacetKinds, RecomputeMode};
use anyhow::{Context, Result};
use glam::Vec3;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("cloning.{driver}.max_clones is {value}; use -1 for uncapped or a count >= 0")]
    InvalidCloneCap { driver: &'static str, value: i32 },
    #[error("static_colliders.plane_tolerance must be positive and finite, got {0}")]
    InvalidPlaneTolerance(f32),
    #[error("physics.gravity must be finite, got {0:?}")]
    NonFiniteGravity([f32; 3]),
}

/// A clone cap is either -1 (uncapped) or a count.
pub fn check_clone_cap(driver: &'static str, value: i32) -> Result<(), ConfigError> {
    if value < -1 {
        return Err(ConfigError::InvalidCloneCap { driver, value });
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhysicsConfig {
    #[serde(default = "PhysicsConfig::default_gravity")]
    pub gravity: [f32; 3],
}

impl PhysicsConfig {
    const fn default_gravity() -> [f32; 3] {
        [0.0, -9.81, 0.0]
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::from_array(self.gravity)
    }
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self { gravity: Self::default_gravity() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "DriverConfig::default_max_clones")]
    pub max_clones: i32,
    /// Facet kinds to clone. Empty selects the driver's preset.
    #[serde(default)]
    pub kinds: Vec<FacetKind>,
    #[serde(default)]
    pub filter: FacetFilter,
}

impl DriverConfig {
    const fn default_max_clones() -> i32 {
        -1
    }

    pub fn kind_set(&self, preset: FacetKinds) -> FacetKinds {
        if self.kinds.is_empty() {
            preset
        } else {
            self.kinds.iter().copied().collect::<FacetKinds>() | FacetKinds::POSE
        }
    }

    pub fn settings(&self, preset: FacetKinds) -> DriverSettings {
        DriverSettings::new(self.kind_set(preset))
            .with_max_clones(self.max_clones)
            .with_filter(self.filter.clone())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { max_clones: Self::default_max_clones(), kinds: Vec::new(), filter: FacetFilter::default() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CloningConfig {
    #[serde(default)]
    pub physics: DriverConfig,
    #[serde(default)]
    pub render: DriverConfig,
}

impl CloningConfig {
    pub fn physics_settings(&self) -> DriverSettings {
        self.physics.settings(FacetKinds::physics())
    }

    pub fn render_settings(&self) -> DriverSettings {
        self.render.settings(FacetKinds::render())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticColliderConfig {
    #[serde(default)]
    pub recompute: RecomputeMode,
    #[serde(default = "StaticColliderConfig::default_plane_tolerance")]
    pub plane_tolerance: f32,
    #[serde(default)]
    pub disable_original: bool,
}

impl StaticColliderConfig {
    const fn default_plane_tolerance() -> f32 {
        1e-3
    }
}

impl Default for StaticColliderConfig {
    fn default() -> Self {
        Self {
            recompute: RecomputeMode::default(),
            plane_tolerance: Self::default_plane_tolerance(),
            disable_original: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PortalConfig {
    #[serde(default)]
    pub physics: PhysicsConfig,
    #[serde(default)]
    pub cloning: CloningConfig,
    #[serde(default)]
    pub static_colliders: StaticColliderConfig,
}

#[derive(Debug, Clone, Default)]
pub struct PortalConfigOverrides {
    pub physics_max_clones: Option<i32>,
    pub render_max_clones: Option<i32>,
    pub static_recompute: Option<RecomputeMode>,
}

impl PortalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: PortalConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        cfg.warn_suspicious();
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (driver, cfg) in [("physics", &self.cloning.physics), ("render", &self.cloning.render)] {
            check_clone_cap(driver, cfg.max_clones)?;
        }
        let tolerance = self.static_colliders.plane_tolerance;
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(ConfigError::InvalidPlaneTolerance(tolerance));
        }
        if self.physics.gravity.iter().any(|g| !g.is_finite()) {
            return Err(ConfigError::NonFiniteGravity(self.physics.gravity));
        }
        Ok(())
    }

    /// Logs settings that are legal but can never do anything useful.
    pub(crate) fn warn_suspicious(&self) {
        for (driver, cfg) in [("physics", &self.cloning.physics), ("render", &self.cloning.render)] {
            if cfg.max_clones == 0 {
                tracing::warn!(driver, "max_clones is 0; this driver will never create clones");
            }
            let contradictions = cfg.filter.contradictions();
            if !contradictions.is_empty() {
                tracing::warn!(driver, ?contradictions, "facet kinds are both allowed and denied");
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &PortalConfigOverrides) {
        if let Some(cap) = overrides.physics_max_clones {
            self.cloning.physics.max_clones = cap;
        }
        if let Some(cap) = overrides.render_max_clones {
            self.cloning.render.max_clones = cap;
        }
        if let Some(recompute) = overrides.static_recompute {
            self.static_colliders.recompute = recompute;
        }
    }
}

impl PortalConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.physics_max_clones.is_none() && self.render_max_clones.is_none() && self.static_recompute.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.physics_max_clones.is_some() {
            fields.push("physics_max_clones");
        }
        if self.render_max_clones.is_some() {
            fields.push("render_max_clones");
        }
        if self.static_recompute.is_some() {
            fields.push("static_recompute");
        }
        fields
    }
}
