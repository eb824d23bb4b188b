//! Telemetry entity types
//!
//! Devices own sensors and sensors produce readings. Devices and sensors are
//! reference data carried into every new shard; readings are high-volume logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Catalog, Entity, EntityClass, KeyPart, KeyPath, Link, Relation};
use crate::error::Result;

/// A physical device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier assigned by the fleet
    pub device_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Device {
    const KIND: &'static str = "device";
    const CLASS: EntityClass = EntityClass::Reference;
    const BUSINESS_KEY: &'static [KeyPath] = &[KeyPath::Field("device_id")];

    fn key_field(&self, field: &str) -> Option<KeyPart> {
        match field {
            "device_id" => Some(self.device_id.as_str().into()),
            _ => None,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A sensor mounted on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub device: Link,
    /// Measurement type, unique per device
    pub sensor_type: String,
    pub created_at: DateTime<Utc>,
}

impl Sensor {
    pub fn new(device: Link, sensor_type: impl Into<String>) -> Self {
        Self {
            device,
            sensor_type: sensor_type.into(),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Sensor {
    const KIND: &'static str = "sensor";
    const CLASS: EntityClass = EntityClass::Reference;
    const BUSINESS_KEY: &'static [KeyPath] = &[KeyPath::Related("device"), KeyPath::Field("sensor_type")];
    const RELATIONS: &'static [Relation] = &[Relation {
        name: "device",
        target: Device::KIND,
    }];

    fn key_field(&self, field: &str) -> Option<KeyPart> {
        match field {
            "sensor_type" => Some(self.sensor_type.as_str().into()),
            _ => None,
        }
    }

    fn link(&self, relation: &str) -> Option<&Link> {
        match relation {
            "device" => Some(&self.device),
            _ => None,
        }
    }

    fn relink(&mut self, relation: &str, link: Link) {
        if relation == "device" {
            self.device = link;
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A single sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorLog {
    pub sensor: Link,
    pub value: f64,
    /// When the reading was taken
    pub recorded_at: DateTime<Utc>,
}

impl SensorLog {
    pub fn new(sensor: Link, value: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            sensor,
            value,
            recorded_at,
        }
    }
}

impl Entity for SensorLog {
    const KIND: &'static str = "sensor_log";
    const CLASS: EntityClass = EntityClass::Log;
    const RELATIONS: &'static [Relation] = &[Relation {
        name: "sensor",
        target: Sensor::KIND,
    }];
    const OWNER: Option<&'static str> = Some("sensor");

    fn link(&self, relation: &str) -> Option<&Link> {
        match relation {
            "sensor" => Some(&self.sensor),
            _ => None,
        }
    }

    fn relink(&mut self, relation: &str, link: Link) {
        if relation == "sensor" {
            self.sensor = link;
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

/// Catalog of the telemetry entity types
pub fn catalog() -> Result<Catalog> {
    Catalog::builder()
        .register::<Device>()
        .register::<Sensor>()
        .register::<SensorLog>()
        .build()
}
