//! Normalization of point cloud detection responses.
//!
//! The inference service answers in two shapes: the legacy shape (flat box
//! coordinates, one logical record per call) and the extended shape (nested
//! contour, one entry per record in a batch). Both are turned into
//! [`DetectionBatchOutcome`] values holding canonical [`DetectionResult`]s.
//!
//! The two paths filter differently: the legacy path enforces the class
//! allow-list, the extended path only enforces the confidence bounds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Status code the inference service uses for success
pub const OK_CODE: &str = "OK";

/// Status code attached to outcomes when the whole call failed
pub const ERROR_CODE: &str = "ERROR";

/// Placeholder for absent identifiers on detection objects
pub const UNKNOWN: &str = "UNKNOWN";

/// Envelope returned by the inference service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn is_ok(&self) -> bool {
        self.code == OK_CODE
    }
}

/// Three-component vector used for centers, rotations and sizes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Per-record entry of a legacy detection response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub id: i64,
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub objects: Vec<LegacyObject>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Legacy detection object with flat box coordinates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyObject {
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub rot_x: Option<f64>,
    pub rot_y: Option<f64>,
    pub rot_z: Option<f64>,
    pub dx: Option<f64>,
    pub dy: Option<f64>,
    pub dz: Option<f64>,
}

impl LegacyObject {
    /// Center, rotation and size, or `None` when any coordinate is missing
    fn geometry(&self) -> Option<(Vec3, Vec3, Vec3)> {
        Some((
            Vec3::new(self.x?, self.y?, self.z?),
            Vec3::new(self.rot_x?, self.rot_y?, self.rot_z?),
            Vec3::new(self.dx?, self.dy?, self.dz?),
        ))
    }
}

/// Per-record entry of an extended (batch) detection response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedRecord {
    pub id: i64,
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub objects: Vec<ExtendedObject>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Extended detection object carrying tracking data and a nested contour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedObject {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub object_type: Option<String>,
    pub class_id: Option<i64>,
    pub class_name: Option<String>,
    pub track_id: Option<String>,
    pub track_name: Option<String>,
    pub contour: Option<Contour>,
    pub model_confidence: Option<f64>,
    pub model_class: Option<String>,
}

/// Box geometry of an extended object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contour {
    #[serde(rename = "pointN")]
    pub point_n: Option<i64>,
    #[serde(rename = "center3D")]
    pub center_3d: Option<Vec3>,
    #[serde(rename = "rotation3D")]
    pub rotation_3d: Option<Vec3>,
    #[serde(rename = "size3D")]
    pub size_3d: Option<Vec3>,
}

/// Canonical object type of normalized detections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectType {
    #[default]
    #[serde(rename = "3D_BOX")]
    Box3D,
}

/// Optional fields of a [`DetectionResult`]; defaults are the placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOptions {
    pub id: String,
    pub track_id: String,
    pub track_name: String,
    pub model_class: Option<String>,
    pub confidence: Option<f64>,
    pub point_count: i64,
    pub class_id: i64,
    pub object_type: ObjectType,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            id: UNKNOWN.to_string(),
            track_id: UNKNOWN.to_string(),
            track_name: UNKNOWN.to_string(),
            model_class: None,
            confidence: None,
            point_count: -1,
            class_id: -1,
            object_type: ObjectType::Box3D,
        }
    }
}

/// Canonical detection object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub id: String,
    pub track_id: String,
    pub track_name: String,
    pub model_class: Option<String>,
    pub confidence: Option<f64>,
    #[serde(rename = "center3D")]
    pub center_3d: Vec3,
    #[serde(rename = "rotation3D")]
    pub rotation_3d: Vec3,
    #[serde(rename = "size3D")]
    pub size_3d: Vec3,
    pub point_count: i64,
    pub class_id: i64,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
}

impl DetectionResult {
    /// Build a result from its geometry; everything else comes from `options`
    pub fn new(center_3d: Vec3, rotation_3d: Vec3, size_3d: Vec3, options: DetectionOptions) -> Self {
        Self {
            id: options.id,
            track_id: options.track_id,
            track_name: options.track_name,
            model_class: options.model_class,
            confidence: options.confidence,
            center_3d,
            rotation_3d,
            size_3d,
            point_count: options.point_count,
            class_id: options.class_id,
            object_type: options.object_type,
        }
    }
}

/// Normalized outcome for one data record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionBatchOutcome {
    pub data_id: Option<i64>,
    pub status_code: String,
    pub message: Option<String>,
    pub confidence: Option<f64>,
    pub objects: Vec<DetectionResult>,
}

impl DetectionBatchOutcome {
    fn new(data_id: Option<i64>, status_code: impl Into<String>, message: Option<String>) -> Self {
        Self {
            data_id,
            status_code: status_code.into(),
            message,
            confidence: None,
            objects: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == OK_CODE
    }

    /// Attach objects; a missing upstream confidence becomes their mean
    fn with_objects(mut self, objects: Vec<DetectionResult>, upstream_confidence: Option<f64>) -> Self {
        self.confidence = upstream_confidence.or_else(|| mean_confidence(&objects));
        self.objects = objects;
        self
    }
}

/// Model class as configured for a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelClass {
    pub code: String,
    pub name: String,
}

/// Lookup from class key to configured model class
#[derive(Debug, Clone, Default)]
pub struct ClassLookup {
    classes: HashMap<String, ModelClass>,
}

impl ClassLookup {
    pub fn new(classes: impl IntoIterator<Item = ModelClass>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|class| (class.code.clone(), class))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ModelClass> {
        self.classes.get(key)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// User supplied filter applied to detection objects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterParams {
    #[serde(default)]
    pub classes: Vec<String>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
}

impl FilterParams {
    /// Inclusive bounds check; an absent bound never rejects
    pub fn confidence_in_range(&self, confidence: Option<f64>) -> bool {
        let above_min = match self.min_confidence {
            Some(min) => confidence.is_some_and(|c| c >= min),
            None => true,
        };
        let below_max = match self.max_confidence {
            Some(max) => confidence.is_some_and(|c| c <= max),
            None => true,
        };
        above_min && below_max
    }

    /// Legacy match: class allow-list (case-insensitive, when non-empty) and bounds
    pub fn matches_legacy(&self, label: Option<&str>, confidence: Option<f64>) -> bool {
        let class_match = self.classes.is_empty()
            || label.is_some_and(|label| {
                self.classes
                    .iter()
                    .any(|class| class.eq_ignore_ascii_case(label))
            });
        class_match && self.confidence_in_range(confidence)
    }

    /// Extended match: bounds only, the class allow-list is not consulted
    pub fn matches_extended(&self, confidence: Option<f64>) -> bool {
        self.confidence_in_range(confidence)
    }
}

/// Strip the ground-truth prefix from a raw model label.
///
/// `GT_PED` maps to `PEDESTRIAN`; any other leading `GT_` is removed once.
pub fn class_key(raw: &str) -> &str {
    if raw == "GT_PED" {
        return "PEDESTRIAN";
    }
    raw.strip_prefix("GT_").unwrap_or(raw)
}

/// Resolve a raw label to its configured class name
pub fn resolve_class_name(raw: Option<&str>, classes: &ClassLookup) -> Option<String> {
    let key = class_key(raw?).trim();
    if key.is_empty() {
        return None;
    }
    let resolved = classes.get(key).map(|class| class.name.clone());
    if resolved.is_none() {
        trace!(label = %key, "No model class configured for label");
    }
    resolved
}

/// Arithmetic mean of the confidences present on `objects`
pub fn mean_confidence(objects: &[DetectionResult]) -> Option<f64> {
    let values: Vec<f64> = objects.iter().filter_map(|o| o.confidence).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Normalize a legacy response into a single outcome.
///
/// A failed call still yields an outcome carrying the error; see
/// [`normalize_batch`] for the batch path, which yields nothing instead.
pub fn normalize_single(
    api_result: &ApiResult<Vec<LegacyRecord>>,
    filter: Option<&FilterParams>,
    classes: &ClassLookup,
) -> DetectionBatchOutcome {
    if !api_result.is_ok() {
        return DetectionBatchOutcome::new(None, ERROR_CODE, api_result.message.clone());
    }

    let records = api_result.data.as_deref().unwrap_or_default();
    let mut outcome = DetectionBatchOutcome::new(records.first().map(|r| r.id), OK_CODE, None);

    for record in records {
        outcome.status_code = record.code.clone();
        outcome.message = record.message.clone();

        if record.code == OK_CODE {
            let objects = normalize_legacy_objects(&record.objects, filter, classes);
            outcome = outcome.with_objects(objects, record.confidence);
        }
    }

    outcome
}

/// Normalize an extended batch response into one outcome per record.
///
/// A failed call or an empty response yields no outcomes at all.
pub fn normalize_batch(
    api_result: &ApiResult<Vec<ExtendedRecord>>,
    filter: Option<&FilterParams>,
    classes: &ClassLookup,
) -> Vec<DetectionBatchOutcome> {
    let records = match api_result.data.as_deref() {
        Some(records) if api_result.is_ok() && !records.is_empty() => records,
        _ => {
            debug!(code = %api_result.code, "Batch detection response has no usable data");
            return Vec::new();
        }
    };

    records
        .iter()
        .map(|record| {
            let outcome =
                DetectionBatchOutcome::new(Some(record.id), record.code.clone(), record.message.clone());
            if record.code == OK_CODE && !record.objects.is_empty() {
                let objects = normalize_extended_objects(&record.objects, filter, classes);
                outcome.with_objects(objects, record.confidence)
            } else {
                outcome
            }
        })
        .collect()
}

fn normalize_legacy_objects(
    objects: &[LegacyObject],
    filter: Option<&FilterParams>,
    classes: &ClassLookup,
) -> Vec<DetectionResult> {
    objects
        .iter()
        .filter_map(|object| {
            let (center, rotation, size) = object.geometry()?;
            if let Some(filter) = filter {
                if !filter.matches_legacy(object.label.as_deref(), object.confidence) {
                    return None;
                }
            }
            let options = DetectionOptions {
                model_class: resolve_class_name(object.label.as_deref(), classes),
                confidence: object.confidence,
                ..Default::default()
            };
            Some(DetectionResult::new(center, rotation, size, options))
        })
        .collect()
}

fn normalize_extended_objects(
    objects: &[ExtendedObject],
    filter: Option<&FilterParams>,
    classes: &ClassLookup,
) -> Vec<DetectionResult> {
    objects
        .iter()
        .filter_map(|object| {
            let contour = object.contour.as_ref()?;
            let center = contour.center_3d?;
            let rotation = contour.rotation_3d?;
            let size = contour.size_3d?;

            if let Some(filter) = filter {
                if !filter.matches_extended(object.model_confidence) {
                    return None;
                }
            }

            let defaults = DetectionOptions::default();
            let options = DetectionOptions {
                id: object.id.clone().unwrap_or(defaults.id),
                track_id: object.track_id.clone().unwrap_or(defaults.track_id),
                track_name: object.track_name.clone().unwrap_or(defaults.track_name),
                model_class: resolve_class_name(object.model_class.as_deref(), classes),
                confidence: object.model_confidence,
                point_count: contour.point_n.unwrap_or(defaults.point_count),
                class_id: object.class_id.unwrap_or(defaults.class_id),
                object_type: ObjectType::Box3D,
            };
            Some(DetectionResult::new(center, rotation, size, options))
        })
        .collect()
}
