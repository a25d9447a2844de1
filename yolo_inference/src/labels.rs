use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead},
    path::Path,
};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Class id to display label lookup for the loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn coco() -> Self {
        Self::new(COCO_LABELS.iter().map(|label| label.to_string()).collect())
    }

    /// Reads one label per line. Anything after a comma is ignored so colored label files
    /// (`label,r,g,b`) load as well.
    pub fn from_file(filepath: &Path) -> io::Result<Self> {
        let file = File::open(filepath)?;
        let reader = io::BufReader::new(file);
        let mut labels = Vec::new();

        for line_result in reader.lines() {
            let line = line_result?;
            let label = line.split(',').next().unwrap_or_default().trim();
            if label.is_empty() {
                continue;
            }
            labels.push(label.to_string());
        }

        if labels.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("No labels found in {}", filepath.display()),
            ));
        }

        Ok(Self::new(labels))
    }

    pub fn label_for(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(String::as_str)
    }

    /// Label for `class_id`, or the stringified id when the table has no entry.
    pub fn display_label(&self, class_id: usize) -> String {
        self.label_for(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| class_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::coco()
    }
}

const APP_CLASS_LABELS: [(usize, &str); 9] = [
    (0, "person"),
    (1, "bike"),
    (2, "vehicle"),
    (5, "vehicle"),
    (7, "vehicle"),
    (9, "traffic_light"),
    (11, "sign"),
    (56, "chair"),
    (60, "table"),
];

const APP_MIN_CONFIDENCE: [(&str, f32); 7] = [
    ("person", 0.4),
    ("vehicle", 0.5),
    ("bike", 0.5),
    ("chair", 0.6),
    ("table", 0.6),
    ("traffic_light", 0.5),
    ("sign", 0.5),
];

/// Application label per class id plus a minimum confidence per application label. Only
/// consulted under the per-label threshold policy; ids without an application label are not
/// reported there.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    class_labels: HashMap<usize, String>,
    thresholds: HashMap<String, f32>,
}

impl ThresholdTable {
    pub fn new(class_labels: HashMap<usize, String>, thresholds: HashMap<String, f32>) -> Self {
        Self {
            class_labels,
            thresholds,
        }
    }

    /// Built-in tables with configured entries layered on top. Class ids come from config as
    /// text keys and must parse as integers.
    pub fn with_overrides(
        class_labels: &HashMap<String, String>,
        thresholds: &HashMap<String, f32>,
    ) -> Result<Self, String> {
        let mut table = Self::default();

        for (class_id, label) in class_labels {
            let class_id: usize = class_id
                .trim()
                .parse()
                .map_err(|_| format!("{} is not a valid class id", class_id))?;
            table.class_labels.insert(class_id, label.clone());
        }
        table
            .thresholds
            .extend(thresholds.iter().map(|(label, min)| (label.clone(), *min)));

        Ok(table)
    }

    pub fn label_for(&self, class_id: usize) -> Option<&str> {
        self.class_labels.get(&class_id).map(String::as_str)
    }

    pub fn min_confidence(&self, label: &str) -> f32 {
        self.thresholds
            .get(label)
            .copied()
            .unwrap_or(DEFAULT_MIN_CONFIDENCE)
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self::new(
            APP_CLASS_LABELS
                .iter()
                .map(|(class_id, label)| (*class_id, label.to_string()))
                .collect(),
            APP_MIN_CONFIDENCE
                .iter()
                .map(|(label, min)| (label.to_string(), *min))
                .collect(),
        )
    }
}
