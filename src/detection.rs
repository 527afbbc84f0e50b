use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of labels the detector model can emit.
///
/// The serialized strings are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionLabel {
    FemaleGenitaliaExposed,
    FemaleGenitaliaCovered,
    FemaleBreastExposed,
    FemaleBreastCovered,
    MaleGenitaliaExposed,
    MaleBreastExposed,
    AnusExposed,
    AnusCovered,
    ButtocksExposed,
    ButtocksCovered,
    BellyExposed,
    BellyCovered,
    FeetExposed,
    FeetCovered,
    ArmpitsExposed,
    ArmpitsCovered,
    FaceFemale,
    FaceMale,
}

impl DetectionLabel {
    pub const ALL: [DetectionLabel; 18] = [
        DetectionLabel::FemaleGenitaliaExposed,
        DetectionLabel::FemaleGenitaliaCovered,
        DetectionLabel::FemaleBreastExposed,
        DetectionLabel::FemaleBreastCovered,
        DetectionLabel::MaleGenitaliaExposed,
        DetectionLabel::MaleBreastExposed,
        DetectionLabel::AnusExposed,
        DetectionLabel::AnusCovered,
        DetectionLabel::ButtocksExposed,
        DetectionLabel::ButtocksCovered,
        DetectionLabel::BellyExposed,
        DetectionLabel::BellyCovered,
        DetectionLabel::FeetExposed,
        DetectionLabel::FeetCovered,
        DetectionLabel::ArmpitsExposed,
        DetectionLabel::ArmpitsCovered,
        DetectionLabel::FaceFemale,
        DetectionLabel::FaceMale,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DetectionLabel::FemaleGenitaliaExposed => "FEMALE_GENITALIA_EXPOSED",
            DetectionLabel::FemaleGenitaliaCovered => "FEMALE_GENITALIA_COVERED",
            DetectionLabel::FemaleBreastExposed => "FEMALE_BREAST_EXPOSED",
            DetectionLabel::FemaleBreastCovered => "FEMALE_BREAST_COVERED",
            DetectionLabel::MaleGenitaliaExposed => "MALE_GENITALIA_EXPOSED",
            DetectionLabel::MaleBreastExposed => "MALE_BREAST_EXPOSED",
            DetectionLabel::AnusExposed => "ANUS_EXPOSED",
            DetectionLabel::AnusCovered => "ANUS_COVERED",
            DetectionLabel::ButtocksExposed => "BUTTOCKS_EXPOSED",
            DetectionLabel::ButtocksCovered => "BUTTOCKS_COVERED",
            DetectionLabel::BellyExposed => "BELLY_EXPOSED",
            DetectionLabel::BellyCovered => "BELLY_COVERED",
            DetectionLabel::FeetExposed => "FEET_EXPOSED",
            DetectionLabel::FeetCovered => "FEET_COVERED",
            DetectionLabel::ArmpitsExposed => "ARMPITS_EXPOSED",
            DetectionLabel::ArmpitsCovered => "ARMPITS_COVERED",
            DetectionLabel::FaceFemale => "FACE_FEMALE",
            DetectionLabel::FaceMale => "FACE_MALE",
        }
    }

    pub fn is_exposed(self) -> bool {
        self.as_str().ends_with("_EXPOSED")
    }
}

impl fmt::Display for DetectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown detection label {0:?}")]
pub struct UnknownLabel(pub String);

impl FromStr for DetectionLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectionLabel::ALL
            .iter()
            .copied()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// One labeled region in original image coordinates.
///
/// Coordinates are not clamped to the image: a box the model predicts
/// partly outside the frame keeps its negative or oversized corners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    #[serde(rename = "box")]
    bbox: [i32; 4],
    score: f32,
    label: DetectionLabel,
}

impl Detection {
    pub fn new(bbox: [i32; 4], score: f32, label: DetectionLabel) -> Self {
        Self { bbox, score, label }
    }

    /// `[x1, y1, x2, y2]` in original image pixels.
    pub fn bbox(&self) -> [i32; 4] {
        self.bbox
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn label(&self) -> DetectionLabel {
        self.label
    }

    pub fn width(&self) -> i32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> i32 {
        self.bbox[3] - self.bbox[1]
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x1, y1, x2, y2] = self.bbox;
        write!(
            f,
            "#<Detection box=[{x1}, {y1}, {x2}, {y2}] score={:.3} label={:?}>",
            self.score,
            self.label.as_str()
        )
    }
}
