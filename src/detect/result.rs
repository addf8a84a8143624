use std::collections::BTreeMap;

use serde::Serialize;

/// How the four numbers of a box are to be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxEncoding {
    /// `[center_y, center_x, width, height]`, normalized to the grid.
    #[default]
    CenterNormalized,
    /// `[x1, y1, x2, y2]` in image pixels.
    CornersPixels,
}

/// Detections for one image.
///
/// `boxes`, `scores` and `labels` are parallel and always the same length.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    boxes: Vec<[f32; 4]>,
    scores: Vec<f32>,
    labels: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    names: Option<BTreeMap<usize, String>>,
    #[serde(skip)]
    encoding: BoxEncoding,
}

/// Borrowed view of a single detection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection<'a> {
    pub bbox: [f32; 4],
    pub score: f32,
    pub label: usize,
    pub name: Option<&'a str>,
}

impl DetectionResult {
    pub fn empty(encoding: BoxEncoding) -> Self {
        Self {
            encoding,
            ..Self::default()
        }
    }

    pub fn with_capacity(encoding: BoxEncoding, capacity: usize) -> Self {
        Self {
            boxes: Vec::with_capacity(capacity),
            scores: Vec::with_capacity(capacity),
            labels: Vec::with_capacity(capacity),
            names: None,
            encoding,
        }
    }

    /// Attach a label id to name lookup.
    pub fn with_names(mut self, names: BTreeMap<usize, String>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn push(&mut self, bbox: [f32; 4], score: f32, label: usize) {
        self.boxes.push(bbox);
        self.scores.push(score);
        self.labels.push(label);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn boxes(&self) -> &[[f32; 4]] {
        &self.boxes
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn names(&self) -> Option<&BTreeMap<usize, String>> {
        self.names.as_ref()
    }

    pub fn encoding(&self) -> BoxEncoding {
        self.encoding
    }

    pub fn label_name(&self, label: usize) -> Option<&str> {
        self.names
            .as_ref()
            .and_then(|names| names.get(&label))
            .map(String::as_str)
    }

    pub fn get(&self, index: usize) -> Option<Detection<'_>> {
        let label = *self.labels.get(index)?;
        Some(Detection {
            bbox: self.boxes[index],
            score: self.scores[index],
            label,
            name: self.label_name(label),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Detection<'_>> + '_ {
        (0..self.len()).filter_map(move |index| self.get(index))
    }

    /// Keep only the entries at `indices`, in that order.
    pub(crate) fn select(&self, indices: &[usize]) -> Self {
        let mut selected = Self::with_capacity(self.encoding, indices.len());
        for &index in indices {
            selected.push(self.boxes[index], self.scores[index], self.labels[index]);
        }
        selected.names = self.names.clone();
        selected
    }

    /// Map every box through `f`, e.g. to rescale from model input to frame pixels.
    pub(crate) fn map_boxes(&mut self, f: impl Fn([f32; 4]) -> [f32; 4]) {
        for bbox in &mut self.boxes {
            *bbox = f(*bbox);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_parallel_arrays() -> anyhow::Result<()> {
        let mut result = DetectionResult::empty(BoxEncoding::CornersPixels)
            .with_names(BTreeMap::from([(3, "dent".to_string())]));
        result.push([1.0, 2.0, 3.0, 4.0], 0.75, 3);

        let json = serde_json::to_value(&result)?;
        assert_eq!(json["boxes"], serde_json::json!([[1.0, 2.0, 3.0, 4.0]]));
        assert_eq!(json["scores"], serde_json::json!([0.75]));
        assert_eq!(json["labels"], serde_json::json!([3]));
        assert_eq!(json["names"]["3"], "dent");
        assert!(json.get("encoding").is_none());
        Ok(())
    }

    #[test]
    fn names_are_omitted_when_absent() -> anyhow::Result<()> {
        let json = serde_json::to_value(DetectionResult::empty(BoxEncoding::CenterNormalized))?;
        assert!(json.get("names").is_none());
        assert_eq!(json["boxes"], serde_json::json!([]));
        Ok(())
    }
}
