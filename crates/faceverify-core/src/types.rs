use crate::geometry::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named facial landmark positions, in the order detectors emit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkId {
    LeftEye,
    RightEye,
    Nose,
    MouthLeft,
    MouthRight,
}

impl LandmarkId {
    pub const ALL: [LandmarkId; 5] = [
        LandmarkId::LeftEye,
        LandmarkId::RightEye,
        LandmarkId::Nose,
        LandmarkId::MouthLeft,
        LandmarkId::MouthRight,
    ];
}

/// Five-point facial landmarks in absolute image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    points: [Point; 5],
}

impl Landmarks {
    pub fn new(points: [Point; 5]) -> Self {
        Self { points }
    }

    pub fn get(&self, id: LandmarkId) -> Point {
        self.points[id as usize]
    }

    pub fn points(&self) -> &[Point; 5] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = (LandmarkId, Point)> + '_ {
        LandmarkId::ALL.iter().map(move |&id| (id, self.get(id)))
    }
}

/// A detected face: box geometry, detection confidence, optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl FaceBox {
    pub fn new(rect: Rect, confidence: f32) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            confidence,
            landmarks: None,
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.x = rect.x;
        self.y = rect.y;
        self.width = rect.width;
        self.height = rect.height;
    }

    pub fn area(&self) -> f32 {
        self.rect().area()
    }
}

/// Where an embedding came from. Mock embeddings are only ever produced by
/// the demo strategy and must never be mistaken for network output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    Network,
    Mock,
}

/// L2-normalized face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g. "mobilefacenet").
    pub model_version: Option<String>,
    pub source: EmbeddingSource,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_mock(&self) -> bool {
        self.source == EmbeddingSource::Mock
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Detection + embedding strategy the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    CascadeAndNetEmbedding,
    HeuristicAndNetEmbedding,
    ContentAwareMockEmbedding,
}

impl Strategy {
    pub fn uses_network_embedding(self) -> bool {
        !matches!(self, Strategy::ContentAwareMockEmbedding)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::CascadeAndNetEmbedding => "cascade_and_net_embedding",
            Strategy::HeuristicAndNetEmbedding => "heuristic_and_net_embedding",
            Strategy::ContentAwareMockEmbedding => "content_aware_mock_embedding",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cascade" | "cascade_and_net_embedding" => Ok(Strategy::CascadeAndNetEmbedding),
            "heuristic" | "heuristic_and_net_embedding" => Ok(Strategy::HeuristicAndNetEmbedding),
            "mock" | "demo" | "content_aware_mock_embedding" => Ok(Strategy::ContentAwareMockEmbedding),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// How raw cosine similarity is reported and compared against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityScale {
    /// Raw dot product of unit vectors, in [-1, 1].
    Cosine,
    /// `(dot + 1) / 2`, in [0, 1].
    UnitInterval,
}

impl SimilarityScale {
    pub fn apply(self, dot: f32) -> f32 {
        match self {
            SimilarityScale::Cosine => dot,
            SimilarityScale::UnitInterval => (dot + 1.0) / 2.0,
        }
    }

    /// Default threshold for this scale. Both values describe the same
    /// decision boundary (raw cosine 0.5).
    pub fn default_threshold(self) -> f32 {
        match self {
            SimilarityScale::Cosine => 0.5,
            SimilarityScale::UnitInterval => 0.75,
        }
    }
}

impl std::str::FromStr for SimilarityScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cosine" => Ok(SimilarityScale::Cosine),
            "unit" | "unit_interval" => Ok(SimilarityScale::UnitInterval),
            other => Err(format!("unknown similarity scale: {other}")),
        }
    }
}

/// Tag attached to every verification result: which strategy produced the
/// embeddings and which similarity scale the numbers are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationMode {
    pub strategy: Strategy,
    pub scale: SimilarityScale,
}

/// Outcome of comparing two embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub similarity: f32,
    pub distance: f32,
    #[serde(rename = "match")]
    pub matched: bool,
    pub confidence: f32,
    pub threshold: f32,
    pub mode: VerificationMode,
    /// True when either embedding came from the mock embedder.
    pub mock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landmarks_lookup_by_name() {
        let lm = Landmarks::new([
            Point::new(1.0, 1.0),
            Point::new(2.0, 1.0),
            Point::new(1.5, 2.0),
            Point::new(1.2, 3.0),
            Point::new(1.8, 3.0),
        ]);
        assert_eq!(lm.get(LandmarkId::Nose), Point::new(1.5, 2.0));
        let ids: Vec<_> = lm.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, LandmarkId::ALL.to_vec());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("mock".parse::<Strategy>().unwrap(), Strategy::ContentAwareMockEmbedding);
        assert_eq!(
            "heuristic-and-net-embedding".parse::<Strategy>().unwrap(),
            Strategy::HeuristicAndNetEmbedding
        );
        assert!("nope".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_scale_thresholds_share_boundary() {
        let boundary = 0.5;
        let unit = SimilarityScale::UnitInterval;
        assert!((unit.apply(boundary) - unit.default_threshold()).abs() < 1e-6);
        assert_eq!(SimilarityScale::Cosine.apply(boundary), SimilarityScale::Cosine.default_threshold());
    }

    #[test]
    fn test_result_serializes_match_and_mode() {
        let result = VerificationResult {
            similarity: 0.9,
            distance: 0.4,
            matched: true,
            confidence: 0.8,
            threshold: 0.5,
            mode: VerificationMode {
                strategy: Strategy::CascadeAndNetEmbedding,
                scale: SimilarityScale::Cosine,
            },
            mock: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["match"], true);
        assert_eq!(json["mode"]["strategy"], "cascade_and_net_embedding");
        assert_eq!(json["mode"]["scale"], "cosine");
    }
}
