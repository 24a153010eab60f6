//! High-level face analysis over an explicit network context.
//!
//! A [`FaceContext`] owns a backend and the networks the caller loaded into it. Detection yields
//! [`FaceAnalysis`] values whose optional fields are filled by the later stages: landmarks,
//! descriptors, expressions and age/gender. A stage either fills every face it was given or
//! leaves all of them untouched and returns the error.

use std::path::Path;

use anyhow::Context as _;
use facelens_utils::{AppSettings, ModelPaths, ResizeQuality, timing_guard};
use image::RgbImage;
use log::debug;
use ndarray::{Array2, ArrayD};

use crate::align::{AlignmentOptions, alignment_box};
use crate::backend::{Backend, NetworkSet, NetworkSlot, run_network, take_output};
use crate::classify::{AgeAndGender, FaceExpressions};
use crate::detector::{DetectedFace, Detection, DetectorOptions, FaceDetector};
use crate::error::{FaceError, Result, ensure_positive};
use crate::geometry::BoundingBox;
use crate::landmarks::{LandmarkSet, decode_landmark_output};
use crate::matcher::Descriptor;
use crate::net_input::{NetInput, NetInputConfig, PadAlignment, PixelNormalization, normalize_batch};
use crate::onnx::{TractBackend, TractNetwork};
use crate::patch::extract_patch;

/// Everything known about one face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnalysis {
    pub detection: Detection,
    pub landmarks: Option<LandmarkSet>,
    pub descriptor: Option<Descriptor>,
    pub expressions: Option<FaceExpressions>,
    pub age_gender: Option<AgeAndGender>,
}

impl FaceAnalysis {
    pub fn new(detection: Detection) -> Self {
        Self {
            detection,
            landmarks: None,
            descriptor: None,
            expressions: None,
            age_gender: None,
        }
    }

    /// Box the patch networks look at: the alignment box once landmarks are known, the
    /// detection box otherwise.
    fn patch_box(&self, alignment: &AlignmentOptions) -> Result<BoundingBox> {
        match &self.landmarks {
            Some(landmarks) => alignment_box(&self.detection, landmarks, alignment),
            None => Ok(self.detection.bbox),
        }
    }
}

impl From<DetectedFace> for FaceAnalysis {
    fn from(face: DetectedFace) -> Self {
        Self {
            landmarks: face.landmarks,
            ..Self::new(face.detection)
        }
    }
}

/// Input sizes and cropping used by the networks that consume face patches.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOptions {
    pub landmarks_input_size: u32,
    pub recognition_input_size: u32,
    pub expression_input_size: u32,
    pub age_gender_input_size: u32,
    pub alignment: AlignmentOptions,
    pub resize_quality: ResizeQuality,
}

impl Default for PatchOptions {
    fn default() -> Self {
        (&AppSettings::default()).into()
    }
}

impl From<&AppSettings> for PatchOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            landmarks_input_size: settings.landmarks.input_size,
            recognition_input_size: settings.recognition.input_size,
            expression_input_size: settings.expression.input_size,
            age_gender_input_size: settings.age_gender.input_size,
            alignment: (&settings.alignment).into(),
            resize_quality: settings.resize_quality,
        }
    }
}

impl PatchOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_positive("landmarks input_size", self.landmarks_input_size)?;
        ensure_positive("recognition input_size", self.recognition_input_size)?;
        ensure_positive("expression input_size", self.expression_input_size)?;
        ensure_positive("age_gender input_size", self.age_gender_input_size)?;
        self.alignment.validate()
    }
}

/// Which stages [`FaceContext::analyze`] runs after detection.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub detector: DetectorOptions,
    pub landmarks: bool,
    /// Implies `landmarks`.
    pub descriptors: bool,
    pub expressions: bool,
    pub age_and_gender: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            detector: DetectorOptions::default(),
            landmarks: true,
            descriptors: true,
            expressions: false,
            age_and_gender: false,
        }
    }
}

impl From<&AppSettings> for PipelineOptions {
    /// Enable every stage whose model is configured.
    fn from(settings: &AppSettings) -> Self {
        let models = &settings.models;
        Self {
            detector: (&settings.detector).into(),
            landmarks: models.landmarks.is_some(),
            descriptors: models.recognition.is_some(),
            expressions: models.expression.is_some(),
            age_and_gender: models.age_gender.is_some(),
        }
    }
}

/// A backend plus the networks loaded into it.
pub struct FaceContext<B: Backend> {
    backend: B,
    networks: NetworkSet<B::Network>,
    patch: PatchOptions,
}

impl<B: Backend> FaceContext<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            networks: NetworkSet::default(),
            patch: PatchOptions::default(),
        }
    }

    pub fn with_patch_options(mut self, patch: PatchOptions) -> Result<Self> {
        patch.validate()?;
        self.patch = patch;
        Ok(self)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn networks(&self) -> &NetworkSet<B::Network> {
        &self.networks
    }

    pub fn patch_options(&self) -> &PatchOptions {
        &self.patch
    }

    /// Put `network` in `slot`, returning the network it replaced.
    pub fn load(&mut self, slot: NetworkSlot, network: B::Network) -> Option<B::Network> {
        debug!("loading {} network", slot.name());
        self.networks.insert(slot, network)
    }

    /// Take the network out of `slot`; dropping it releases it.
    pub fn unload(&mut self, slot: NetworkSlot) -> Option<B::Network> {
        debug!("unloading {} network", slot.name());
        self.networks.remove(slot)
    }

    pub fn is_loaded(&self, slot: NetworkSlot) -> bool {
        self.networks.is_loaded(slot)
    }

    /// Detect faces in a batch of images.
    ///
    /// # Arguments
    ///
    /// * `images` - The images to search; result `i` belongs to `images[i]`.
    /// * `options` - Detector variant and its thresholds.
    pub fn detect_all(
        &self,
        images: &[&RgbImage],
        options: &DetectorOptions,
    ) -> Result<Vec<Vec<FaceAnalysis>>> {
        let _guard = timing_guard("facelens::detect_all", log::Level::Debug);
        let detector = FaceDetector::new(options)?;
        let detected = detector.detect(&self.backend, &self.networks, images)?;
        Ok(detected
            .into_iter()
            .map(|faces| faces.into_iter().map(FaceAnalysis::from).collect())
            .collect())
    }

    /// The highest scoring face in `image`, if any.
    pub fn detect_single(
        &self,
        image: &RgbImage,
        options: &DetectorOptions,
    ) -> Result<Option<FaceAnalysis>> {
        let faces = self.detect_all(&[image], options)?;
        Ok(faces
            .into_iter()
            .flatten()
            .reduce(|best, face| {
                if face.detection.score > best.detection.score {
                    face
                } else {
                    best
                }
            }))
    }

    /// Place 68 landmarks on every face, replacing any landmarks the detector produced.
    ///
    /// # Arguments
    ///
    /// * `image` - The image the faces were detected in.
    /// * `faces` - Faces to update in place.
    pub fn with_landmarks(&self, image: &RgbImage, faces: &mut [FaceAnalysis]) -> Result<()> {
        if faces.is_empty() {
            return Ok(());
        }
        let _guard = timing_guard("facelens::landmarks", log::Level::Debug);
        let (width, height) = check_faces(image, faces)?;
        // Whole-pixel crops, so the remap origin matches the patch's first pixel.
        let crops: Vec<BoundingBox> = faces
            .iter()
            .map(|f| f.detection.bbox.round().clip_to_image(width, height))
            .collect();
        let size = self.patch.landmarks_input_size;
        let (input, mut outputs) = self.run_patches(
            NetworkSlot::Landmarks,
            image,
            &crops,
            size,
            PixelNormalization::LANDMARKS,
        )?;
        let name = NetworkSlot::Landmarks.name();
        let rows = rows_of(take_output(&mut outputs, 0, name)?, faces.len(), name)?;

        let sets = crops
            .iter()
            .zip(input.entries())
            .zip(rows.outer_iter())
            .map(|((crop, entry), row)| {
                decode_landmark_output(&row.to_vec(), size, entry, crop, width, height)
            })
            .collect::<Result<Vec<_>>>()?;
        for (face, set) in faces.iter_mut().zip(sets) {
            face.landmarks = Some(set);
        }
        Ok(())
    }

    /// Compute a recognition descriptor for every face. Faces need landmarks.
    pub fn with_descriptors(&self, image: &RgbImage, faces: &mut [FaceAnalysis]) -> Result<()> {
        if faces.is_empty() {
            return Ok(());
        }
        let _guard = timing_guard("facelens::descriptors", log::Level::Debug);
        check_faces(image, faces)?;
        let aligned = faces
            .iter()
            .enumerate()
            .map(|(i, face)| match &face.landmarks {
                Some(landmarks) => alignment_box(&face.detection, landmarks, &self.patch.alignment),
                None => Err(FaceError::invalid(format!(
                    "face {i} has no landmarks; run landmark detection first"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        let (_, mut outputs) = self.run_patches(
            NetworkSlot::Recognition,
            image,
            &aligned,
            self.patch.recognition_input_size,
            PixelNormalization::RECOGNITION,
        )?;
        let name = NetworkSlot::Recognition.name();
        let rows = rows_of(take_output(&mut outputs, 0, name)?, faces.len(), name)?;
        let descriptors = rows
            .outer_iter()
            .map(|row| Descriptor::from_network(row.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        for (face, descriptor) in faces.iter_mut().zip(descriptors) {
            face.descriptor = Some(descriptor);
        }
        Ok(())
    }

    /// Classify the facial expression of every face.
    pub fn with_expressions(&self, image: &RgbImage, faces: &mut [FaceAnalysis]) -> Result<()> {
        if faces.is_empty() {
            return Ok(());
        }
        let _guard = timing_guard("facelens::expressions", log::Level::Debug);
        check_faces(image, faces)?;
        let boxes = self.patch_boxes(faces)?;
        let (_, mut outputs) = self.run_patches(
            NetworkSlot::Expression,
            image,
            &boxes,
            self.patch.expression_input_size,
            PixelNormalization::RECOGNITION,
        )?;
        let name = NetworkSlot::Expression.name();
        let rows = rows_of(take_output(&mut outputs, 0, name)?, faces.len(), name)?;
        let expressions = rows
            .outer_iter()
            .map(|row| FaceExpressions::from_output(&row.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        for (face, expression) in faces.iter_mut().zip(expressions) {
            face.expressions = Some(expression);
        }
        Ok(())
    }

    /// Estimate age and gender of every face.
    ///
    /// The network emits the age regression first and the `[male, female]` scores second.
    pub fn with_age_and_gender(&self, image: &RgbImage, faces: &mut [FaceAnalysis]) -> Result<()> {
        if faces.is_empty() {
            return Ok(());
        }
        let _guard = timing_guard("facelens::age_gender", log::Level::Debug);
        check_faces(image, faces)?;
        let boxes = self.patch_boxes(faces)?;
        let (_, mut outputs) = self.run_patches(
            NetworkSlot::AgeGender,
            image,
            &boxes,
            self.patch.age_gender_input_size,
            PixelNormalization::RECOGNITION,
        )?;
        let name = NetworkSlot::AgeGender.name();
        let ages = rows_of(take_output(&mut outputs, 0, name)?, faces.len(), name)?;
        let genders = rows_of(take_output(&mut outputs, 1, name)?, faces.len(), name)?;
        let estimates = ages
            .outer_iter()
            .zip(genders.outer_iter())
            .map(|(age, gender)| AgeAndGender::from_output(age[0], &gender.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        for (face, estimate) in faces.iter_mut().zip(estimates) {
            face.age_gender = Some(estimate);
        }
        Ok(())
    }

    /// Detect faces in `image` and run the stages enabled in `options`.
    pub fn analyze(&self, image: &RgbImage, options: &PipelineOptions) -> Result<Vec<FaceAnalysis>> {
        let _guard = timing_guard("facelens::analyze", log::Level::Debug);
        let mut faces = self
            .detect_all(&[image], &options.detector)?
            .into_iter()
            .next()
            .unwrap_or_default();
        if options.landmarks || options.descriptors {
            self.with_landmarks(image, &mut faces)?;
        }
        if options.descriptors {
            self.with_descriptors(image, &mut faces)?;
        }
        if options.expressions {
            self.with_expressions(image, &mut faces)?;
        }
        if options.age_and_gender {
            self.with_age_and_gender(image, &mut faces)?;
        }
        debug!("analyzed {} faces", faces.len());
        Ok(faces)
    }

    fn patch_boxes(&self, faces: &[FaceAnalysis]) -> Result<Vec<BoundingBox>> {
        faces
            .iter()
            .map(|face| face.patch_box(&self.patch.alignment))
            .collect()
    }

    /// Cut `boxes` out of `image`, letterbox them into one batch and run the network in `slot`.
    fn run_patches(
        &self,
        slot: NetworkSlot,
        image: &RgbImage,
        boxes: &[BoundingBox],
        input_size: u32,
        normalization: PixelNormalization,
    ) -> Result<(NetInput, Vec<ArrayD<f32>>)> {
        let network = self.networks.require(slot)?;
        let patches = boxes
            .iter()
            .map(|b| extract_patch(image, b))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&RgbImage> = patches.iter().collect();
        let config = NetInputConfig::new(input_size)
            .with_alignment(PadAlignment::Center)
            .with_normalization(normalization)
            .with_resize_quality(self.patch.resize_quality);
        let batch = normalize_batch(&refs, &config)?;
        let outputs = run_network(&self.backend, slot.name(), network, &batch.tensor)?;
        Ok((batch.input, outputs))
    }
}

impl FaceContext<TractBackend> {
    /// Build a CPU context and load every model listed in `models`.
    pub fn from_model_paths(models: &ModelPaths) -> anyhow::Result<Self> {
        let mut context = Self::new(TractBackend::new());
        let listed = [
            (NetworkSlot::Ssd, &models.ssd),
            (NetworkSlot::Tiny, &models.tiny),
            (NetworkSlot::MtcnnProposal, &models.mtcnn_proposal),
            (NetworkSlot::MtcnnRefine, &models.mtcnn_refine),
            (NetworkSlot::MtcnnOutput, &models.mtcnn_output),
            (NetworkSlot::Landmarks, &models.landmarks),
            (NetworkSlot::Recognition, &models.recognition),
            (NetworkSlot::Expression, &models.expression),
            (NetworkSlot::AgeGender, &models.age_gender),
        ];
        for (slot, path) in listed {
            if let Some(path) = path {
                let network = context.load_model(slot, path)?;
                context.load(slot, network);
            }
        }
        Ok(context)
    }

    /// Load an ONNX model for `slot` without installing it.
    pub fn load_model<P: AsRef<Path>>(&self, slot: NetworkSlot, path: P) -> anyhow::Result<TractNetwork> {
        let path = path.as_ref();
        self.backend
            .load_network(slot.name(), path, None)
            .with_context(|| format!("failed to load {} model from {}", slot.name(), path.display()))
    }
}

/// Faces must belong to `image`; returns its dimensions.
fn check_faces(image: &RgbImage, faces: &[FaceAnalysis]) -> Result<(u32, u32)> {
    let (width, height) = image.dimensions();
    if let Some((i, face)) = faces.iter().enumerate().find(|(_, f)| {
        (f.detection.image_width, f.detection.image_height) != (width, height)
    }) {
        return Err(FaceError::invalid(format!(
            "face {i} was detected on a {}x{} image, not this {width}x{height} one",
            face.detection.image_width, face.detection.image_height
        )));
    }
    Ok((width, height))
}

/// View a network output as one row per face.
fn rows_of(array: ArrayD<f32>, faces: usize, network: &str) -> Result<Array2<f32>> {
    let len = array.len();
    if faces == 0 || len == 0 || len % faces != 0 || array.shape().first() != Some(&faces) {
        return Err(FaceError::output(
            network,
            format!("output {:?} does not hold one row per face ({faces})", array.shape()),
        ));
    }
    let values: Vec<f32> = array.iter().copied().collect();
    Array2::from_shape_vec((faces, len / faces), values)
        .map_err(|e| FaceError::output(network, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelens_utils::{AlignmentKind, AlignmentSettings};

    #[test]
    fn rows_follow_the_batch_dimension() {
        let array = ArrayD::from_shape_vec(vec![2, 1, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        let rows = rows_of(array, 2, "test").unwrap();
        assert_eq!(rows.shape(), &[2, 3]);
        assert_eq!(rows[[1, 0]], 3.0);

        let array = ArrayD::<f32>::zeros(vec![3, 4]);
        assert!(matches!(rows_of(array, 2, "test"), Err(FaceError::Output { .. })));
    }

    #[test]
    fn settings_enable_configured_stages() {
        let mut settings = AppSettings::default();
        settings.models.landmarks = Some("landmarks.onnx".into());
        settings.alignment = AlignmentSettings {
            kind: AlignmentKind::Dlib,
            margin: 0.0,
        };
        let options = PipelineOptions::from(&settings);
        assert!(options.landmarks);
        assert!(!options.descriptors);
        assert_eq!(PatchOptions::from(&settings).alignment, AlignmentOptions::Dlib);
    }

    #[test]
    fn faces_from_other_images_are_rejected() {
        let image = RgbImage::new(10, 10);
        let faces = [FaceAnalysis::new(Detection::new(
            BoundingBox::new(0.0, 0.0, 5.0, 5.0),
            0.9,
            20,
            10,
        ))];
        assert!(matches!(check_faces(&image, &faces), Err(FaceError::InvalidInput(_))));
    }
}
