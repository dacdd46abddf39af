//! Simulated motor.
//!
//! Moves at constant speed from where it was to the commanded destination.
//! Position is computed from the elapsed time whenever it is read, so there
//! is no background task; a move "finishes" the first time the position is
//! read after the arrival time.

use crate::common::FaultInjector;
use async_trait::async_trait;
use mx_core::field::FieldFlags;
use mx_core::{
    standard_fields, unknown_label, ClassId, ConstructContext, Constructible, DeviceComponents,
    DriverEntry, FieldDefault, FieldProcessable, FieldType, FieldValue, MxError, MxResult, Openable,
    ProcessOp, Record, StorageLocation, SuperclassId, DYNAMIC_TYPE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Static type id of `soft_motor`.
pub const SOFT_MOTOR_TYPE: i64 = 10;

/// Speed used when the database leaves `speed` at zero (units/s).
pub const DEFAULT_SPEED: f64 = 1000.0;

/// Label values of the motor fields.
pub mod label {
    /// `position`
    pub const POSITION: i64 = 2001;
    /// `destination`
    pub const DESTINATION: i64 = 2002;
    /// `speed`
    pub const SPEED: i64 = 2003;
    /// `busy`
    pub const BUSY: i64 = 2004;
    /// `stop`
    pub const STOP: i64 = 2005;
    /// `set_position`
    pub const SET_POSITION: i64 = 2006;
}

static PROCESSED: &[i64] = &[
    label::POSITION,
    label::DESTINATION,
    label::SPEED,
    label::BUSY,
    label::STOP,
    label::SET_POSITION,
];

/// Field layout shared by every motor type.
pub fn fields() -> Vec<FieldDefault> {
    let mut fields = standard_fields();
    fields.extend([
        FieldDefault::new("position", FieldType::Double, StorageLocation::class(0x00))
            .label(label::POSITION)
            .flags(FieldFlags::IN_DESCRIPTION | FieldFlags::IN_SUMMARY | FieldFlags::POLL),
        FieldDefault::new("destination", FieldType::Double, StorageLocation::class(0x08))
            .label(label::DESTINATION),
        FieldDefault::new("speed", FieldType::Double, StorageLocation::class(0x10))
            .label(label::SPEED)
            .flags(FieldFlags::IN_DESCRIPTION),
        FieldDefault::new("busy", FieldType::Bool, StorageLocation::class(0x18))
            .label(label::BUSY)
            .flags(FieldFlags::READ_ONLY | FieldFlags::POLL),
        FieldDefault::new("stop", FieldType::Bool, StorageLocation::class(0x1c)).label(label::STOP),
        FieldDefault::new("set_position", FieldType::Double, StorageLocation::class(0x20))
            .label(label::SET_POSITION),
        FieldDefault::new("negative_limit", FieldType::Double, StorageLocation::class(0x28))
            .flags(FieldFlags::IN_DESCRIPTION),
        FieldDefault::new("positive_limit", FieldType::Double, StorageLocation::class(0x30))
            .flags(FieldFlags::IN_DESCRIPTION),
    ]);
    fields
}

/// Driver table entry for `soft_motor`.
pub fn entry(faults: FaultInjector) -> DriverEntry {
    DriverEntry::new("soft_motor", SuperclassId::DEVICE, ClassId::MOTOR, SOFT_MOTOR_TYPE)
        .constructor(Arc::new(SoftMotorDriver { faults }))
        .fields(fields())
}

/// Driver table entry for `dynamic_motor`, a soft motor whose type id is
/// allocated at registration.
pub fn dynamic_entry(faults: FaultInjector) -> DriverEntry {
    DriverEntry::new("dynamic_motor", SuperclassId::DEVICE, ClassId::MOTOR, DYNAMIC_TYPE)
        .constructor(Arc::new(SoftMotorDriver { faults }))
        .fields(fields())
}

// =============================================================================
// Motion model
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    origin: f64,
    target: f64,
    started: Instant,
    speed: f64,
    moving: bool,
}

impl Motion {
    fn at_rest(position: f64, speed: f64) -> Self {
        Self {
            origin: position,
            target: position,
            started: Instant::now(),
            speed,
            moving: false,
        }
    }

    /// Position at `now`, settling the move if it has arrived.
    fn update(&mut self, now: Instant) -> f64 {
        if !self.moving {
            return self.target;
        }
        let travelled = self.speed * now.duration_since(self.started).as_secs_f64();
        let distance = self.target - self.origin;
        if travelled >= distance.abs() {
            self.moving = false;
            self.origin = self.target;
            return self.target;
        }
        self.origin + travelled.copysign(distance)
    }
}

/// A simulated motor.
pub struct SoftMotor {
    name: String,
    faults: FaultInjector,
    motion: Mutex<Motion>,
}

impl SoftMotor {
    /// Motor at rest at `position`.
    pub fn new(name: impl Into<String>, position: f64, speed: f64, faults: FaultInjector) -> Self {
        Self {
            name: name.into(),
            faults,
            motion: Mutex::new(Motion::at_rest(position, speed)),
        }
    }

    /// Current position.
    pub fn position(&self) -> f64 {
        self.motion.lock().update(Instant::now())
    }

    /// True while a move is in progress.
    pub fn is_busy(&self) -> bool {
        let mut motion = self.motion.lock();
        motion.update(Instant::now());
        motion.moving
    }

    /// Current speed (units/s).
    pub fn speed(&self) -> f64 {
        self.motion.lock().speed
    }

    /// Start a move to `target`.
    pub fn move_to(&self, target: f64) -> MxResult<()> {
        if !target.is_finite() {
            return Err(MxError::IllegalArgument(format!(
                "motor '{}': destination {} is not a number",
                self.name, target
            )));
        }
        let mut motion = self.motion.lock();
        let now = Instant::now();
        let position = motion.update(now);
        motion.origin = position;
        motion.target = target;
        motion.started = now;
        motion.moving = position != target;
        debug!(motor = %self.name, from = position, to = target, "Move started");
        Ok(())
    }

    /// Halt where the motor is now.
    pub fn stop(&self) {
        let mut motion = self.motion.lock();
        let position = motion.update(Instant::now());
        let speed = motion.speed;
        *motion = Motion::at_rest(position, speed);
    }

    /// Redefine the current position without moving.
    pub fn set_position(&self, position: f64) -> MxResult<()> {
        let mut motion = self.motion.lock();
        motion.update(Instant::now());
        if motion.moving {
            return Err(MxError::IllegalArgument(format!(
                "motor '{}' cannot redefine its position while moving",
                self.name
            )));
        }
        let speed = motion.speed;
        *motion = Motion::at_rest(position, speed);
        Ok(())
    }

    /// Change the speed used by subsequent moves.
    pub fn set_speed(&self, speed: f64) -> MxResult<()> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(MxError::IllegalArgument(format!(
                "motor '{}': speed must be positive, got {}",
                self.name, speed
            )));
        }
        let mut motion = self.motion.lock();
        let now = Instant::now();
        let position = motion.update(now);
        if motion.moving {
            motion.origin = position;
            motion.started = now;
        }
        motion.speed = speed;
        Ok(())
    }

    fn check_limits(&self, record: &Record, target: f64) -> MxResult<()> {
        let negative = record.f64_or("negative_limit", 0.0);
        let positive = record.f64_or("positive_limit", 0.0);
        if negative < positive && !(negative..=positive).contains(&target) {
            return Err(MxError::IllegalArgument(format!(
                "motor '{}': destination {} is outside the limits [{}, {}]",
                self.name, target, negative, positive
            )));
        }
        Ok(())
    }

    fn store_position(&self, record: &mut Record) -> MxResult<()> {
        record.set_value_by_name("position", FieldValue::Double(self.position()))
    }
}

#[async_trait]
impl FieldProcessable for SoftMotor {
    fn processed_labels(&self) -> &'static [i64] {
        PROCESSED
    }

    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
        let field = record.field(ordinal)?;
        let label_value = field.label_value;
        self.faults.check(&self.name, &format!("{} {}", op, field.name))?;

        match (label_value, op) {
            (label::POSITION, ProcessOp::Get) => self.store_position(record),
            (label::POSITION | label::DESTINATION, ProcessOp::Put) => {
                let target = record.value(ordinal)?.as_f64().unwrap_or(0.0);
                self.check_limits(record, target)?;
                self.move_to(target)?;
                record.set_value_by_name("destination", FieldValue::Double(target))?;
                record.set_value_by_name("busy", FieldValue::Bool(self.is_busy()))
            }
            (label::SPEED, ProcessOp::Get) => record.set_value(ordinal, FieldValue::Double(self.speed())),
            (label::SPEED, ProcessOp::Put) => {
                let speed = record.f64_or("speed", 0.0);
                self.set_speed(speed)
            }
            (label::BUSY, ProcessOp::Get) => record.set_value(ordinal, FieldValue::Bool(self.is_busy())),
            (label::STOP, ProcessOp::Put) => {
                if record.value(ordinal)?.as_bool() == Some(true) {
                    self.stop();
                    info!(motor = %self.name, position = self.position(), "Motor stopped");
                    record.set_value(ordinal, FieldValue::Bool(false))?;
                    record.set_value_by_name("busy", FieldValue::Bool(false))?;
                    self.store_position(record)?;
                }
                Ok(())
            }
            (label::SET_POSITION, ProcessOp::Put) => {
                let position = record.f64_or("set_position", 0.0);
                self.set_position(position)?;
                record.set_value_by_name("destination", FieldValue::Double(position))?;
                self.store_position(record)
            }
            _ => unknown_label(record, ordinal, op),
        }
    }
}

#[async_trait]
impl Openable for SoftMotor {
    async fn open(&self, record: &mut Record) -> MxResult<()> {
        self.faults.check(&self.name, "open")?;
        let position = self.position();
        record.set_value_by_name("position", FieldValue::Double(position))?;
        record.set_value_by_name("destination", FieldValue::Double(position))?;
        record.set_value_by_name("speed", FieldValue::Double(self.speed()))?;
        Ok(())
    }

    async fn close(&self, _record: &mut Record) -> MxResult<()> {
        self.stop();
        Ok(())
    }

    async fn resynchronize(&self, record: &mut Record) -> MxResult<()> {
        self.stop();
        record.set_value_by_name("busy", FieldValue::Bool(false))?;
        self.store_position(record)
    }
}

/// Constructor for soft motors.
struct SoftMotorDriver {
    faults: FaultInjector,
}

impl Constructible for SoftMotorDriver {
    fn create(&self, record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
        let mut speed = record.f64_or("speed", 0.0);
        if speed <= 0.0 {
            speed = DEFAULT_SPEED;
        }
        let motor = Arc::new(SoftMotor::new(
            record.name.clone(),
            record.f64_or("position", 0.0),
            speed,
            self.faults.clone(),
        ));
        Ok(DeviceComponents::new()
            .with_processor(motor.clone())
            .with_openable(motor))
    }
}
