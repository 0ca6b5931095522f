//! Visual vocabulary for place recognition.
//!
//! Words are normalized intensity patches. A keyframe is described by the
//! histogram of the words nearest to the patches around its map points.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::process_image::FloatImage;
use crate::error::{Result, SlamError};

/// Sparse, L1-normalized word histogram.
pub type BowVector = BTreeMap<usize, f32>;

#[derive(Deserialize)]
struct VocabularyFile {
    patch_size: usize,
    words: Vec<Vec<f32>>,
}

#[derive(Clone, Debug)]
pub struct Vocabulary {
    patch_size: usize,
    words: Vec<Vec<f32>>,
}

impl Vocabulary {
    pub fn load(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(SlamError::Vocabulary("no vocabulary given, use vocab=".into()));
        }
        let text = fs::read_to_string(path)
            .map_err(|e| SlamError::Vocabulary(format!("could not read {path:?}: {e}")))?;
        let file: VocabularyFile = serde_json::from_str(&text)?;
        let vocabulary = Self::from_words(file.patch_size, file.words)?;
        info!(
            "loaded vocabulary with {} words of {}x{} patches",
            vocabulary.len(),
            vocabulary.patch_size,
            vocabulary.patch_size
        );
        Ok(vocabulary)
    }

    pub fn from_words(patch_size: usize, words: Vec<Vec<f32>>) -> Result<Self> {
        if patch_size < 2 {
            return Err(SlamError::Vocabulary(format!(
                "patch size {patch_size} is too small"
            )));
        }
        if words.is_empty() {
            return Err(SlamError::Vocabulary("vocabulary is empty".into()));
        }
        if let Some((i, w)) = words
            .iter()
            .enumerate()
            .find(|(_, w)| w.len() != patch_size * patch_size)
        {
            return Err(SlamError::Vocabulary(format!(
                "word {i} has {} values, expected {}",
                w.len(),
                patch_size * patch_size
            )));
        }
        let words = words
            .into_iter()
            .enumerate()
            .map(|(i, word)| {
                normalize(word)
                    .ok_or_else(|| SlamError::Vocabulary(format!("word {i} has no texture")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patch_size, words })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Zero-mean, unit-norm patch centered on a pixel. `None` near the border
    /// or on textureless patches.
    pub fn descriptor(&self, img: &FloatImage, x: usize, y: usize) -> Option<Vec<f32>> {
        let half = self.patch_size / 2;
        let x0 = x.checked_sub(half)?;
        let y0 = y.checked_sub(half)?;
        if x0 + self.patch_size > img.width || y0 + self.patch_size > img.height {
            return None;
        }

        let mut patch = Vec::with_capacity(self.patch_size * self.patch_size);
        for v in y0..y0 + self.patch_size {
            for u in x0..x0 + self.patch_size {
                patch.push(img.at(u, v));
            }
        }
        normalize(patch)
    }

    /// Index of the nearest word.
    pub fn quantize(&self, descriptor: &[f32]) -> usize {
        let distance = |w: &[f32]| {
            w.iter()
                .zip(descriptor)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
        };
        self.words
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| distance(a.as_slice()).total_cmp(&distance(b.as_slice())))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    pub fn transform(&self, img: &FloatImage, points: &[(usize, usize)]) -> BowVector {
        let mut bow = BowVector::new();
        for &(x, y) in points {
            if let Some(desc) = self.descriptor(img, x, y) {
                *bow.entry(self.quantize(&desc)).or_default() += 1.0;
            }
        }
        let total: f32 = bow.values().sum();
        if total > 0.0 {
            bow.values_mut().for_each(|v| *v /= total);
        }
        bow
    }
}

fn normalize(mut patch: Vec<f32>) -> Option<Vec<f32>> {
    let mean = patch.iter().sum::<f32>() / patch.len() as f32;
    patch.iter_mut().for_each(|p| *p -= mean);
    let norm = patch.iter().map(|p| p * p).sum::<f32>().sqrt();
    if norm < 1e-6 {
        return None;
    }
    patch.iter_mut().for_each(|p| *p /= norm);
    Some(patch)
}

/// L1 similarity in [0, 1] between two normalized word histograms.
pub fn score(a: &BowVector, b: &BowVector) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut distance = 0.0;
    for (word, va) in a {
        distance += (va - b.get(word).copied().unwrap_or(0.0)).abs();
    }
    for (word, vb) in b {
        if !a.contains_key(word) {
            distance += vb.abs();
        }
    }
    1.0 - 0.5 * distance
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_vocabulary() -> Vocabulary {
        let horizontal = vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0];
        let vertical = vec![-1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let diagonal = vec![-1.0, -0.5, 0.0, -0.5, 0.0, 0.5, 0.0, 0.5, 1.0];
        let spot = vec![-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];
        Vocabulary::from_words(3, vec![horizontal, vertical, diagonal, spot]).unwrap()
    }

    #[test]
    fn loads_json_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        fs::write(&path, r#"{"patch_size": 2, "words": [[1, 0, 0, -1], [0, 1, -1, 0]]}"#).unwrap();
        let vocabulary = Vocabulary::load(&path).unwrap();
        assert_eq!(vocabulary.len(), 2);
        assert_eq!(vocabulary.patch_size(), 2);
    }

    #[test]
    fn broken_vocabularies_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");

        assert!(matches!(Vocabulary::load(Path::new("")), Err(SlamError::Vocabulary(_))));
        assert!(Vocabulary::load(&dir.path().join("missing.json")).is_err());

        fs::write(&path, r#"{"patch_size": 2, "words": []}"#).unwrap();
        assert!(Vocabulary::load(&path).is_err());
        fs::write(&path, r#"{"patch_size": 2, "words": [[1, 2, 3]]}"#).unwrap();
        assert!(Vocabulary::load(&path).is_err());
        fs::write(&path, r#"{"patch_size": 2, "words": [[5, 5, 5, 5]]}"#).unwrap();
        assert!(Vocabulary::load(&path).is_err());
        fs::write(&path, "not json").unwrap();
        assert!(matches!(Vocabulary::load(&path), Err(SlamError::Json(_))));
    }

    #[test]
    fn descriptors_quantize_to_matching_words() {
        let vocabulary = test_vocabulary();
        let img = FloatImage::new(5, 5, (0..25).map(|i| (i % 5) as f32 * 10.0).collect());
        let desc = vocabulary.descriptor(&img, 2, 2).unwrap();
        assert_eq!(vocabulary.quantize(&desc), 0);

        let transposed = FloatImage::new(5, 5, (0..25).map(|i| (i / 5) as f32 * 10.0).collect());
        let desc = vocabulary.descriptor(&transposed, 2, 2).unwrap();
        assert_eq!(vocabulary.quantize(&desc), 1);

        assert!(vocabulary.descriptor(&img, 0, 2).is_none());
        assert!(vocabulary.descriptor(&FloatImage::new(5, 5, vec![3.0; 25]), 2, 2).is_none());
    }

    #[test]
    fn l1_score() {
        let a: BowVector = [(0, 0.5), (1, 0.5)].into_iter().collect();
        let b: BowVector = [(1, 0.5), (2, 0.5)].into_iter().collect();
        let c: BowVector = [(3, 1.0)].into_iter().collect();
        assert_relative_eq!(score(&a, &a), 1.0);
        assert_relative_eq!(score(&a, &b), 0.5);
        assert_relative_eq!(score(&a, &c), 0.0);
        assert_eq!(score(&a, &BowVector::new()), 0.0);
    }
}
