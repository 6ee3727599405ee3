//! Device Registry
//!
//! Named lookup for the two device roles a scan needs. Controllers resolve
//! their camera and positioner once, at construction, and hand the owned
//! handles to the sequencer; nothing looks devices up by name during a run.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use scan_daq::hardware::registry::DeviceRegistry;
//!
//! let mut registry = DeviceRegistry::new();
//! registry.register_camera("cam1", Arc::new(MockCamera::default()))?;
//! registry.register_positioner("pos1", Arc::new(MockStage::new()))?;
//!
//! let camera = registry.camera("cam1")?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{FrameSource, StagePositioner};
use crate::hardware::mock::{MockCamera, MockStage};

/// Unique name of a registered device (e.g. "cam1", "pos1")
pub type DeviceId = String;

// =============================================================================
// Device Registry
// =============================================================================

/// Registry of cameras and positioners by name.
#[derive(Default)]
pub struct DeviceRegistry {
    cameras: HashMap<DeviceId, Arc<dyn FrameSource>>,
    positioners: HashMap<DeviceId, Arc<dyn StagePositioner>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one simulated camera and stage, named as in `config`.
    pub fn simulated(config: &AppConfig) -> AppResult<Self> {
        let mut registry = Self::new();

        let camera = MockCamera::new(config.camera.sensor_width, config.camera.sensor_height)
            .with_exposure_ms(config.camera.exposure_ms);
        registry.register_camera(config.camera.name.clone(), Arc::new(camera))?;

        let mut stage = MockStage::new();
        if let Some(resolution) = config.positioner.resolution_mm {
            stage = stage.with_resolution(resolution);
        }
        registry.register_positioner(config.positioner.name.clone(), Arc::new(stage))?;

        Ok(registry)
    }

    /// Register a camera
    ///
    /// # Errors
    /// Fails when the name is already taken.
    pub fn register_camera(
        &mut self,
        name: impl Into<DeviceId>,
        camera: Arc<dyn FrameSource>,
    ) -> AppResult<()> {
        let name = name.into();
        if self.cameras.contains_key(&name) {
            return Err(DaqError::Configuration(format!(
                "Camera '{name}' is already registered"
            )));
        }
        debug!(camera = %name, "Registered camera");
        self.cameras.insert(name, camera);
        Ok(())
    }

    /// Register a positioner
    ///
    /// # Errors
    /// Fails when the name is already taken.
    pub fn register_positioner(
        &mut self,
        name: impl Into<DeviceId>,
        positioner: Arc<dyn StagePositioner>,
    ) -> AppResult<()> {
        let name = name.into();
        if self.positioners.contains_key(&name) {
            return Err(DaqError::Configuration(format!(
                "Positioner '{name}' is already registered"
            )));
        }
        debug!(positioner = %name, "Registered positioner");
        self.positioners.insert(name, positioner);
        Ok(())
    }

    /// Resolve a camera by name.
    ///
    /// There is no fallback to another camera: a missing name is a configuration error.
    pub fn camera(&self, name: &str) -> AppResult<Arc<dyn FrameSource>> {
        self.cameras
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::DeviceNotConfigured {
                role: "camera",
                name: name.to_string(),
                available: self.camera_names(),
            })
    }

    /// Resolve a positioner by name.
    pub fn positioner(&self, name: &str) -> AppResult<Arc<dyn StagePositioner>> {
        self.positioners
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::DeviceNotConfigured {
                role: "positioner",
                name: name.to_string(),
                available: self.positioner_names(),
            })
    }

    /// Sorted camera names
    pub fn camera_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cameras.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted positioner names
    pub fn positioner_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.positioners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of registered devices
    pub fn len(&self) -> usize {
        self.cameras.len() + self.positioners.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
