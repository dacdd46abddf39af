//! Simulated multichannel analyzer.
//!
//! `start` begins a preset-time acquisition on a background task. When the
//! preset expires the task adds a Gaussian peak to the spectrum, clears
//! `busy` and posts a value-changed message for `busy` through the
//! callback channel, so clients waiting on `busy` hear about it without
//! polling.

use crate::common::{FaultInjector, SoftRng};
use async_trait::async_trait;
use mx_core::field::FieldFlags;
use mx_core::{
    standard_fields, unknown_label, CallbackSender, ClassId, ConstructContext, Constructible,
    DeviceComponents, DriverDescriptor, DriverEntry, FieldAddress, FieldDefault, FieldProcessable,
    FieldShape, FieldType, FieldValue, MxError, MxResult, Openable, ProcessOp, Record,
    StorageLocation, SuperclassId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Static type id of `soft_mca`.
pub const SOFT_MCA_TYPE: i64 = 30;

/// Channels in the largest spectrum.
pub const MAX_CHANNELS: usize = 1024;

/// Regions of interest.
pub const MAX_ROIS: usize = 16;

/// Label values of the MCA fields.
pub mod label {
    /// `channel_array`
    pub const CHANNEL_ARRAY: i64 = 2201;
    /// `start`
    pub const START: i64 = 2202;
    /// `stop`
    pub const STOP: i64 = 2203;
    /// `clear`
    pub const CLEAR: i64 = 2204;
    /// `busy`
    pub const BUSY: i64 = 2205;
    /// `roi_integral_array`
    pub const ROI_INTEGRAL_ARRAY: i64 = 2206;
}

static PROCESSED: &[i64] = &[
    label::CHANNEL_ARRAY,
    label::START,
    label::STOP,
    label::CLEAR,
    label::BUSY,
    label::ROI_INTEGRAL_ARRAY,
];

/// MCA field layout. Array lengths are filled in by [`size_arrays`].
pub fn fields() -> Vec<FieldDefault> {
    let mut fields = standard_fields();
    fields.extend([
        FieldDefault::new("channel_array", FieldType::ULong, StorageLocation::class(0x00))
            .label(label::CHANNEL_ARRAY)
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("current_num_channels", FieldType::Long, StorageLocation::class(0x08))
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("preset_real_time", FieldType::Double, StorageLocation::class(0x10)),
        FieldDefault::new("start", FieldType::Bool, StorageLocation::class(0x18)).label(label::START),
        FieldDefault::new("stop", FieldType::Bool, StorageLocation::class(0x1c)).label(label::STOP),
        FieldDefault::new("clear", FieldType::Bool, StorageLocation::class(0x20)).label(label::CLEAR),
        FieldDefault::new("busy", FieldType::Bool, StorageLocation::class(0x24))
            .label(label::BUSY)
            .flags(FieldFlags::READ_ONLY | FieldFlags::POLL),
        FieldDefault::new("roi_array", FieldType::ULong, StorageLocation::class(0x28)),
        FieldDefault::new("roi_integral_array", FieldType::ULong, StorageLocation::class(0x30))
            .label(label::ROI_INTEGRAL_ARRAY)
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("num_channels", FieldType::Long, StorageLocation::type_struct(0x00))
            .flags(FieldFlags::IN_DESCRIPTION),
        FieldDefault::new("count_rate", FieldType::Double, StorageLocation::type_struct(0x08))
            .flags(FieldFlags::IN_DESCRIPTION),
    ]);
    fields
}

/// Registration hook: size the spectrum and ROI arrays.
pub fn size_arrays(driver: &mut DriverDescriptor) -> MxResult<()> {
    for field in driver.field_defaults.iter_mut() {
        let max_len = match field.name.as_str() {
            "channel_array" => MAX_CHANNELS,
            "roi_array" => 2 * MAX_ROIS,
            "roi_integral_array" => MAX_ROIS,
            _ => continue,
        };
        field.shape = FieldShape::Array { max_len };
    }
    Ok(())
}

/// Driver table entry for `soft_mca`.
pub fn entry(faults: FaultInjector) -> DriverEntry {
    DriverEntry::new("soft_mca", SuperclassId::DEVICE, ClassId::MCA, SOFT_MCA_TYPE)
        .constructor(Arc::new(SoftMcaDriver { faults }))
        .initialize_with(size_arrays)
        .fields(fields())
}

// =============================================================================
// Acquisition state
// =============================================================================

#[derive(Debug)]
struct Acquisition {
    busy: bool,
    generation: u64,
    started: Instant,
    preset: Duration,
    spectrum: Vec<u64>,
}

impl Acquisition {
    /// Add the counts collected over `seconds` of live time.
    fn accumulate(&mut self, seconds: f64, count_rate: f64, rng: &SoftRng) {
        let channels = self.spectrum.len();
        if channels == 0 || seconds <= 0.0 {
            return;
        }
        let center = channels as f64 / 2.0;
        let sigma = (channels as f64 / 20.0).max(1.0);
        let norm = 1.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt());
        let total = count_rate * seconds;
        for (channel, counts) in self.spectrum.iter_mut().enumerate() {
            let z = (channel as f64 - center) / sigma;
            let expected = total * norm * (-0.5 * z * z).exp();
            let sampled = expected + rng.noise(expected.sqrt());
            *counts += sampled.round().max(0.0) as u64;
        }
    }
}

/// A simulated MCA.
pub struct SoftMca {
    name: String,
    count_rate: f64,
    faults: FaultInjector,
    rng: Arc<SoftRng>,
    state: Arc<Mutex<Acquisition>>,
    notifier: Option<CallbackSender>,
    busy_field: Option<FieldAddress>,
}

impl SoftMca {
    fn new(name: String, num_channels: usize, count_rate: f64, faults: FaultInjector) -> Self {
        Self {
            name,
            count_rate: count_rate.max(0.0),
            faults,
            rng: Arc::new(SoftRng::default()),
            state: Arc::new(Mutex::new(Acquisition {
                busy: false,
                generation: 0,
                started: Instant::now(),
                preset: Duration::ZERO,
                spectrum: vec![0; num_channels],
            })),
            notifier: None,
            busy_field: None,
        }
    }

    /// Number of channels in the spectrum.
    pub fn num_channels(&self) -> usize {
        self.state.lock().spectrum.len()
    }

    /// True while an acquisition is running.
    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Copy of the spectrum.
    pub fn spectrum(&self) -> Vec<u64> {
        self.state.lock().spectrum.clone()
    }

    /// Begin a preset-time acquisition of `seconds`.
    pub fn start(&self, seconds: f64) -> MxResult<()> {
        if !(seconds > 0.0 && seconds.is_finite()) {
            return Err(MxError::IllegalArgument(format!(
                "mca '{}': preset real time must be positive, got {}",
                self.name, seconds
            )));
        }
        let preset = Duration::from_secs_f64(seconds);
        let generation = {
            let mut acq = self.state.lock();
            if acq.busy {
                return Err(MxError::IllegalArgument(format!(
                    "mca '{}' is already acquiring",
                    self.name
                )));
            }
            acq.busy = true;
            acq.generation += 1;
            acq.started = Instant::now();
            acq.preset = preset;
            acq.generation
        };

        let state = self.state.clone();
        let rng = self.rng.clone();
        let notifier = self.notifier.clone();
        let busy_field = self.busy_field;
        let count_rate = self.count_rate;
        let name = self.name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(preset).await;
            {
                let mut acq = state.lock();
                if !acq.busy || acq.generation != generation {
                    return;
                }
                acq.accumulate(preset.as_secs_f64(), count_rate, &rng);
                acq.busy = false;
            }
            debug!(mca = %name, "Acquisition finished");
            if let (Some(notifier), Some(field)) = (notifier, busy_field) {
                if let Err(err) = notifier.value_changed(field) {
                    warn!(mca = %name, error = %err, "Could not post busy change");
                }
            }
        });
        debug!(mca = %self.name, seconds, "Acquisition started");
        Ok(())
    }

    /// End the running acquisition early, keeping the counts collected so far.
    pub fn stop(&self) {
        let mut acq = self.state.lock();
        if !acq.busy {
            return;
        }
        let live = acq.started.elapsed().min(acq.preset).as_secs_f64();
        acq.accumulate(live, self.count_rate, &self.rng);
        acq.busy = false;
        acq.generation += 1;
    }

    /// Zero the spectrum.
    pub fn clear(&self) {
        self.state.lock().spectrum.fill(0);
    }

    /// Integrate the spectrum over `(low, high)` channel pairs, inclusive.
    pub fn roi_integrals(&self, rois: &[u64]) -> MxResult<Vec<u64>> {
        if rois.len() % 2 != 0 {
            return Err(MxError::IllegalArgument(format!(
                "mca '{}': roi_array needs low/high pairs, got {} values",
                self.name,
                rois.len()
            )));
        }
        let acq = self.state.lock();
        rois.chunks_exact(2)
            .map(|pair| {
                let (low, high) = (pair[0] as usize, pair[1] as usize);
                if low > high || high >= acq.spectrum.len() {
                    return Err(MxError::IllegalArgument(format!(
                        "mca '{}': roi [{}, {}] is outside 0..{}",
                        self.name,
                        low,
                        high,
                        acq.spectrum.len()
                    )));
                }
                Ok(acq.spectrum[low..=high].iter().sum())
            })
            .collect()
    }

    fn command_set(record: &Record, ordinal: usize) -> MxResult<bool> {
        Ok(record.value(ordinal)?.as_bool() == Some(true))
    }
}

#[async_trait]
impl FieldProcessable for SoftMca {
    fn processed_labels(&self) -> &'static [i64] {
        PROCESSED
    }

    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
        let field = record.field(ordinal)?;
        let label_value = field.label_value;
        self.faults.check(&self.name, &format!("{} {}", op, field.name))?;

        match (label_value, op) {
            (label::CHANNEL_ARRAY, ProcessOp::Get) => {
                record.set_value(ordinal, FieldValue::ULongArray(self.spectrum()))
            }
            (label::BUSY, ProcessOp::Get) => record.set_value(ordinal, FieldValue::Bool(self.is_busy())),
            (label::START, ProcessOp::Put) => {
                if Self::command_set(record, ordinal)? {
                    record.set_value(ordinal, FieldValue::Bool(false))?;
                    self.start(record.f64_or("preset_real_time", 0.0))?;
                    record.set_value_by_name("busy", FieldValue::Bool(true))?;
                }
                Ok(())
            }
            (label::STOP, ProcessOp::Put) => {
                if Self::command_set(record, ordinal)? {
                    self.stop();
                    record.set_value(ordinal, FieldValue::Bool(false))?;
                    record.set_value_by_name("busy", FieldValue::Bool(false))?;
                }
                Ok(())
            }
            (label::CLEAR, ProcessOp::Put) => {
                if Self::command_set(record, ordinal)? {
                    self.clear();
                    record.set_value(ordinal, FieldValue::Bool(false))?;
                }
                Ok(())
            }
            (label::ROI_INTEGRAL_ARRAY, ProcessOp::Get) => {
                let rois = match record.value_by_name("roi_array")? {
                    FieldValue::ULongArray(rois) => rois.clone(),
                    _ => Vec::new(),
                };
                let integrals = self.roi_integrals(&rois)?;
                record.set_value(ordinal, FieldValue::ULongArray(integrals))
            }
            _ => unknown_label(record, ordinal, op),
        }
    }
}

#[async_trait]
impl Openable for SoftMca {
    async fn open(&self, record: &mut Record) -> MxResult<()> {
        self.faults.check(&self.name, "open")?;
        record.set_value_by_name(
            "current_num_channels",
            FieldValue::Long(self.num_channels() as i64),
        )
    }

    async fn close(&self, _record: &mut Record) -> MxResult<()> {
        self.stop();
        Ok(())
    }

    async fn resynchronize(&self, record: &mut Record) -> MxResult<()> {
        self.stop();
        record.set_value_by_name("busy", FieldValue::Bool(false))
    }
}

struct SoftMcaDriver {
    faults: FaultInjector,
}

impl Constructible for SoftMcaDriver {
    fn create(&self, record: &Record, ctx: &ConstructContext) -> MxResult<DeviceComponents> {
        let requested = record.i64_or("num_channels", 0);
        let num_channels = match usize::try_from(requested) {
            Ok(0) => MAX_CHANNELS,
            Ok(n) if n <= MAX_CHANNELS => n,
            _ => {
                return Err(MxError::IllegalArgument(format!(
                    "mca '{}': num_channels {} is not in 1..={}",
                    record.name, requested, MAX_CHANNELS
                )))
            }
        };
        let mut mca = SoftMca::new(
            record.name.clone(),
            num_channels,
            record.f64_or("count_rate", 0.0),
            self.faults.clone(),
        );
        mca.notifier = ctx.notifier.clone();
        mca.busy_field = ctx
            .record_id
            .zip(record.field_index("busy"))
            .map(|(id, ordinal)| FieldAddress::new(id, ordinal));
        let mca = Arc::new(mca);
        Ok(DeviceComponents::new()
            .with_processor(mca.clone())
            .with_openable(mca))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{build_record, build_record_with};
    use mx_core::{get_field_value, put_field_value, CallbackMessage, RecordId};

    async fn put(record: &mut Record, name: &str, value: FieldValue) -> MxResult<()> {
        let ordinal = record.field_index(name).unwrap();
        put_field_value(record, ordinal, value).await
    }

    async fn get(record: &mut Record, name: &str) -> FieldValue {
        let ordinal = record.field_index(name).unwrap();
        get_field_value(record, ordinal).await.unwrap()
    }

    fn values() -> Vec<(&'static str, FieldValue)> {
        vec![
            ("num_channels", FieldValue::Long(128)),
            ("count_rate", FieldValue::Double(1.0e5)),
            ("preset_real_time", FieldValue::Double(2.0)),
        ]
    }

    #[tokio::test]
    async fn hook_sizes_the_arrays() {
        let record = build_record(entry(FaultInjector::none()), "mca1", &values()).await;
        let shape = record.field_by_name("channel_array").unwrap().shape;
        assert_eq!(shape, FieldShape::Array { max_len: MAX_CHANNELS });
        assert_eq!(
            record.value_by_name("current_num_channels").unwrap(),
            &FieldValue::Long(128)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_acquisition_posts_busy_change() {
        let (notifier, mut rx) = CallbackSender::channel(8);
        let ctx = ConstructContext {
            record_id: Some(RecordId(4)),
            notifier: Some(notifier),
        };
        let mut record = build_record_with(entry(FaultInjector::none()), "mca1", &values(), ctx).await;
        let busy = record.field_index("busy").unwrap();

        put(&mut record, "start", FieldValue::Bool(true)).await.unwrap();
        assert_eq!(get(&mut record, "busy").await, FieldValue::Bool(true));
        assert_eq!(record.value_by_name("start").unwrap(), &FieldValue::Bool(false));

        let message = rx.recv().await.unwrap();
        assert_eq!(
            message,
            CallbackMessage::ValueChanged(FieldAddress::new(RecordId(4), busy))
        );
        assert_eq!(get(&mut record, "busy").await, FieldValue::Bool(false));

        let total: u64 = match get(&mut record, "channel_array").await {
            FieldValue::ULongArray(counts) => {
                assert_eq!(counts.len(), 128);
                counts.iter().sum()
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(total > 100_000, "total {}", total);
    }

    #[tokio::test(start_paused = true)]
    async fn roi_integrals_match_the_spectrum() {
        let mut record = build_record(entry(FaultInjector::none()), "mca1", &values()).await;
        put(&mut record, "start", FieldValue::Bool(true)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let spectrum = match get(&mut record, "channel_array").await {
            FieldValue::ULongArray(counts) => counts,
            other => panic!("unexpected {:?}", other),
        };
        put(&mut record, "roi_array", FieldValue::LongArray(vec![0, 127, 60, 67]))
            .await
            .unwrap();
        let expected = vec![spectrum.iter().sum::<u64>(), spectrum[60..=67].iter().sum()];
        assert_eq!(
            get(&mut record, "roi_integral_array").await,
            FieldValue::ULongArray(expected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bad_roi_is_an_error() {
        let mut record = build_record(entry(FaultInjector::none()), "mca1", &values()).await;
        put(&mut record, "roi_array", FieldValue::LongArray(vec![10, 500]))
            .await
            .unwrap();
        let ordinal = record.field_index("roi_integral_array").unwrap();
        let err = get_field_value(&mut record, ordinal).await.unwrap_err();
        assert!(matches!(err, MxError::IllegalArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_partial_counts_and_suppresses_completion() {
        let (notifier, mut rx) = CallbackSender::channel(8);
        let ctx = ConstructContext {
            record_id: Some(RecordId(1)),
            notifier: Some(notifier),
        };
        let mut record = build_record_with(entry(FaultInjector::none()), "mca1", &values(), ctx).await;
        put(&mut record, "start", FieldValue::Bool(true)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        put(&mut record, "stop", FieldValue::Bool(true)).await.unwrap();
        assert_eq!(get(&mut record, "busy").await, FieldValue::Bool(false));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        put(&mut record, "clear", FieldValue::Bool(true)).await.unwrap();
        match get(&mut record, "channel_array").await {
            FieldValue::ULongArray(counts) => assert!(counts.iter().all(|c| *c == 0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_needs_a_preset() {
        let mut record = build_record(
            entry(FaultInjector::none()),
            "mca1",
            &[("num_channels", FieldValue::Long(16))],
        )
        .await;
        let err = put(&mut record, "start", FieldValue::Bool(true)).await.unwrap_err();
        assert!(matches!(err, MxError::IllegalArgument(_)));
        assert_eq!(get(&mut record, "busy").await, FieldValue::Bool(false));
    }

    #[tokio::test]
    async fn oversized_channel_count_fails_construction() {
        let registry = crate::testing::registry_with(entry(FaultInjector::none()));
        let driver = registry.lookup_type_by_name("soft_mca").unwrap().clone();
        let mut record = Record::new(RecordId(1), "big", driver).unwrap();
        record
            .set_value_by_name("num_channels", FieldValue::Long(MAX_CHANNELS as i64 + 1))
            .unwrap();
        assert!(record.construct(&ConstructContext::default()).is_err());
    }
}
