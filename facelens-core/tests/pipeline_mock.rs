//! End-to-end pipeline runs against a scripted in-memory backend.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use facelens_core::{
    AnchorSet, Backend, BackendResult, BoundingBox, BoxCoder, DetectorOptions, FaceContext,
    FaceError, Gender, MtcnnDetector, MtcnnOptions, NetworkSet, NetworkSlot, PipelineOptions,
    ScoreActivation, SsdOptions,
};
use image::{Rgb, RgbImage};
use ndarray::{ArrayD, IxDyn};

type Respond = Box<dyn Fn(&[usize]) -> Vec<ArrayD<f32>> + Send + Sync>;

/// A scripted network: its outputs depend only on the input shape.
struct MockNetwork {
    name: &'static str,
    respond: Respond,
    fail: bool,
}

impl MockNetwork {
    fn new(name: &'static str, respond: impl Fn(&[usize]) -> Vec<ArrayD<f32>> + Send + Sync + 'static) -> Self {
        Self {
            name,
            respond: Box::new(respond),
            fail: false,
        }
    }

    fn failing(name: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, |_| Vec::new())
        }
    }
}

#[derive(Default)]
struct MockBackend {
    live: AtomicUsize,
    calls: Mutex<Vec<&'static str>>,
}

impl MockBackend {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl Backend for MockBackend {
    type Tensor = ArrayD<f32>;
    type Network = MockNetwork;

    fn allocate(&self, shape: &[usize], data: Vec<f32>) -> BackendResult<ArrayD<f32>> {
        let tensor = ArrayD::from_shape_vec(IxDyn(shape), data)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(tensor)
    }

    fn forward(&self, network: &MockNetwork, input: &ArrayD<f32>) -> BackendResult<Vec<ArrayD<f32>>> {
        self.calls.lock().unwrap().push(network.name);
        if network.fail {
            return Err(format!("{} exploded", network.name).into());
        }
        let outputs = (network.respond)(input.shape());
        self.live.fetch_add(outputs.len(), Ordering::SeqCst);
        Ok(outputs)
    }

    fn read(&self, tensor: &ArrayD<f32>) -> BackendResult<ArrayD<f32>> {
        Ok(tensor.clone())
    }

    fn dispose(&self, _tensor: &ArrayD<f32>) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn live_tensors(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

const SSD_INPUT: u32 = 100;

/// Two anchors; image 0 scores both, image 1 only the second.
fn ssd_options() -> DetectorOptions {
    ssd_options_with(BoundingBox::new(60.0, 20.0, 30.0, 30.0))
}

fn ssd_options_with(second_anchor: BoundingBox) -> DetectorOptions {
    DetectorOptions::Ssd(SsdOptions {
        input_size: SSD_INPUT,
        min_confidence: 0.5,
        coder: BoxCoder::default(),
        activation: ScoreActivation::Identity,
        anchors: Some(AnchorSet::from_boxes(vec![
            BoundingBox::new(10.0, 10.0, 30.0, 30.0),
            second_anchor,
        ])),
        ..SsdOptions::default()
    })
}

fn ssd_network() -> MockNetwork {
    MockNetwork::new("ssd", |shape| {
        let batch = shape[0];
        let boxes = ArrayD::zeros(IxDyn(&[batch, 2, 4]));
        let scores = ArrayD::from_shape_fn(IxDyn(&[batch, 2, 1]), |ix| match (ix[0], ix[1]) {
            (0, 0) => 0.9,
            (0, 1) => 0.8,
            (_, 0) => 0.2,
            _ => 0.95,
        });
        vec![boxes, scores]
    })
}

/// 68 points spread over the patch, as fractions of the network input.
fn landmarks_network() -> MockNetwork {
    MockNetwork::new("landmarks", |shape| {
        let batch = shape[0];
        vec![ArrayD::from_shape_fn(IxDyn(&[batch, 136]), |ix| {
            let point = ix[1] / 2;
            if ix[1] % 2 == 0 {
                0.2 + 0.6 * (point % 17) as f32 / 16.0
            } else {
                0.2 + 0.6 * (point / 17) as f32 / 3.0
            }
        })]
    })
}

fn recognition_network() -> MockNetwork {
    MockNetwork::new("recognition", |shape| {
        vec![ArrayD::from_elem(IxDyn(&[shape[0], 128]), 0.05)]
    })
}

/// Face `i` of a batch is most likely expression `i + 1` (happy, sad, ...).
fn expression_network() -> MockNetwork {
    MockNetwork::new("expression", |shape| {
        vec![ArrayD::from_shape_fn(IxDyn(&[shape[0], 7]), |ix| {
            if ix[1] == (ix[0] + 1) % 7 { 0.88 } else { 0.02 }
        })]
    })
}

/// Face `i` is `20 + 10 * i` years old; even faces are male, odd ones female.
fn age_gender_network(flat_age: bool) -> MockNetwork {
    MockNetwork::new("age_gender", move |shape| {
        let n = shape[0];
        let age_shape: Vec<usize> = if flat_age { vec![n] } else { vec![n, 1] };
        let ages = ArrayD::from_shape_fn(IxDyn(&age_shape), |ix| 20.0 + 10.0 * ix[0] as f32);
        let genders = ArrayD::from_shape_fn(IxDyn(&[n, 2]), |ix| match (ix[0] % 2, ix[1]) {
            (0, 0) => 0.8,
            (0, _) => 0.2,
            (_, 0) => 0.3,
            _ => 0.7,
        });
        vec![ages, genders]
    })
}

fn ssd_context() -> FaceContext<MockBackend> {
    let mut context = FaceContext::new(MockBackend::default());
    context.load(NetworkSlot::Ssd, ssd_network());
    context.load(NetworkSlot::Landmarks, landmarks_network());
    context.load(NetworkSlot::Recognition, recognition_network());
    context
}

fn gray(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

#[test]
fn batch_results_keep_input_order_and_dimensions() {
    let context = ssd_context();
    let wide = gray(200, 100);
    let square = gray(50, 50);
    let results = context.detect_all(&[&wide, &square], &ssd_options()).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].len(), 2);
    assert_eq!(results[1].len(), 1);
    assert_eq!(results[0][0].detection.bbox, BoundingBox::new(20.0, 20.0, 60.0, 60.0));
    assert_eq!(results[1][0].detection.bbox, BoundingBox::new(30.0, 10.0, 15.0, 15.0));
    for face in &results[0] {
        assert_eq!((face.detection.image_width, face.detection.image_height), (200, 100));
    }
    assert_eq!(
        (results[1][0].detection.image_width, results[1][0].detection.image_height),
        (50, 50)
    );
    assert_eq!(context.backend().calls(), vec!["ssd"]);
}

#[test]
fn full_analysis_releases_every_tensor() {
    let context = ssd_context();
    let image = gray(200, 100);
    let before = context.backend().live_tensors();

    let options = PipelineOptions {
        detector: ssd_options(),
        ..PipelineOptions::default()
    };
    let faces = context.analyze(&image, &options).unwrap();

    assert_eq!(context.backend().live_tensors(), before);
    assert_eq!(faces.len(), 2);
    for face in &faces {
        let landmarks = face.landmarks.as_ref().expect("landmarks");
        assert_eq!(landmarks.len(), 68);
        let bbox = face.detection.bbox;
        assert!(landmarks.positions.iter().all(|p| {
            p.x >= bbox.x && p.x <= bbox.x2() && p.y >= bbox.y && p.y <= bbox.y2()
        }));
        assert_eq!(face.descriptor.as_ref().map(|d| d.len()), Some(128));
        assert!(face.expressions.is_none());
    }
    assert_eq!(context.backend().calls(), vec!["ssd", "landmarks", "recognition"]);
}

#[test]
fn detect_single_picks_highest_score() {
    let context = ssd_context();
    let face = context
        .detect_single(&gray(200, 100), &ssd_options())
        .unwrap()
        .expect("a face");
    assert!((face.detection.score - 0.9).abs() < 1e-6);
}

#[test]
fn backend_failure_leaves_faces_untouched() {
    let mut context = ssd_context();
    context.load(NetworkSlot::Recognition, MockNetwork::failing("recognition"));
    let image = gray(200, 100);
    let mut faces = context
        .detect_all(&[&image], &ssd_options())
        .unwrap()
        .remove(0);
    context.with_landmarks(&image, &mut faces).unwrap();
    let snapshot = faces.clone();

    let err = context.with_descriptors(&image, &mut faces).unwrap_err();
    assert!(matches!(&err, FaceError::Backend { network, .. } if network == "recognition"));
    assert_eq!(faces, snapshot);
    assert_eq!(context.backend().live_tensors(), 0);
}

#[test]
fn descriptors_need_landmarks() {
    let context = ssd_context();
    let image = gray(200, 100);
    let mut faces = context
        .detect_all(&[&image], &ssd_options())
        .unwrap()
        .remove(0);
    assert!(matches!(
        context.with_descriptors(&image, &mut faces),
        Err(FaceError::InvalidInput(_))
    ));
    assert!(!context.backend().calls().contains(&"recognition"));
}

#[test]
fn missing_networks_and_empty_batches_are_errors() {
    let mut context = ssd_context();
    assert!(context.unload(NetworkSlot::Ssd).is_some());
    let image = gray(40, 40);
    assert!(matches!(
        context.detect_all(&[&image], &ssd_options()),
        Err(FaceError::MissingNetwork(name)) if name == "ssd"
    ));
    assert!(matches!(
        ssd_context().detect_all(&[], &ssd_options()),
        Err(FaceError::InvalidInput(_))
    ));
    assert_eq!(context.backend().live_tensors(), 0);
}

/// Proposal net output for an NHWC pyramid level: one face cell at the origin when `hit`.
fn pnet(hit: bool) -> MockNetwork {
    MockNetwork::new("pnet", move |shape| {
        let (h, w) = ((shape[1] - 12) / 2 + 1, (shape[2] - 12) / 2 + 1);
        let prob = ArrayD::from_shape_fn(IxDyn(&[1, h, w, 2]), |ix| {
            let face = if hit && ix[1] == 0 && ix[2] == 0 { 0.9 } else { 0.01 };
            if ix[3] == 1 { face } else { 1.0 - face }
        });
        vec![prob, ArrayD::zeros(IxDyn(&[1, h, w, 4]))]
    })
}

fn rnet() -> MockNetwork {
    MockNetwork::new("rnet", |shape| {
        let n = shape[0];
        let scores = ArrayD::from_shape_fn(IxDyn(&[n, 2]), |ix| if ix[1] == 1 { 0.9 } else { 0.1 });
        vec![scores, ArrayD::zeros(IxDyn(&[n, 4]))]
    })
}

fn onet() -> MockNetwork {
    const POINTS: [f32; 10] = [0.3, 0.7, 0.5, 0.35, 0.65, 0.3, 0.3, 0.55, 0.75, 0.75];
    MockNetwork::new("onet", |shape| {
        let n = shape[0];
        let scores = ArrayD::from_shape_fn(IxDyn(&[n, 2]), |ix| if ix[1] == 1 { 0.95 } else { 0.05 });
        let points = ArrayD::from_shape_fn(IxDyn(&[n, 10]), |ix| POINTS[ix[1]]);
        vec![scores, ArrayD::zeros(IxDyn(&[n, 4])), points]
    })
}

fn cascade_networks(hit: bool) -> NetworkSet<MockNetwork> {
    let mut networks = NetworkSet::default();
    networks.insert(NetworkSlot::MtcnnProposal, pnet(hit));
    networks.insert(NetworkSlot::MtcnnRefine, rnet());
    networks.insert(NetworkSlot::MtcnnOutput, onet());
    networks
}

#[test]
fn cascade_refines_nested_proposals() {
    let backend = MockBackend::default();
    let networks = cascade_networks(true);
    let detector = MtcnnDetector::new(MtcnnOptions::default()).unwrap();
    let faces = detector.detect(&backend, &networks, &gray(60, 60)).unwrap();

    // Four pyramid levels each propose a box at the top-left corner. The min-area overlap of the
    // refine stage folds the two middle boxes into the first; the largest one overlaps it by
    // less than the threshold and survives.
    let calls = backend.calls();
    assert_eq!(calls.iter().filter(|c| **c == "pnet").count(), 4);
    assert_eq!(&calls[4..], &["rnet", "onet"]);
    assert_eq!(backend.live_tensors(), 0);

    assert_eq!(faces.len(), 2);
    assert_eq!(faces[1].detection.bbox, BoundingBox::from_corners(5.0, 5.0, 56.0, 56.0));
    let face = &faces[0];
    assert_eq!(face.detection.bbox, BoundingBox::from_corners(2.0, 2.0, 20.0, 20.0));
    assert!((face.detection.score - 0.95).abs() < 1e-6);
    let landmarks = face.landmarks.as_ref().expect("cascade landmarks");
    assert_eq!(landmarks.len(), 5);
    assert!((landmarks.positions[0].x - 7.4).abs() < 1e-3);
    assert!((landmarks.positions[0].y - 7.4).abs() < 1e-3);
}

#[test]
fn cascade_stops_when_no_proposal_survives() {
    let backend = MockBackend::default();
    let networks = cascade_networks(false);
    let detector = MtcnnDetector::new(MtcnnOptions::default()).unwrap();
    let faces = detector.detect(&backend, &networks, &gray(60, 60)).unwrap();
    assert!(faces.is_empty());
    assert!(backend.calls().iter().all(|c| *c == "pnet"));
    assert_eq!(backend.live_tensors(), 0);
}

#[test]
fn cancelled_cascade_runs_no_network() {
    let backend = MockBackend::default();
    let networks = cascade_networks(true);
    let detector = MtcnnDetector::new(MtcnnOptions::default()).unwrap();
    let cancel = AtomicBool::new(true);
    let result = detector.detect_with_cancel(&backend, &networks, &gray(60, 60), &cancel);
    assert!(matches!(result, Err(FaceError::Cancelled)));
    assert!(backend.calls().is_empty());
}

#[test]
fn cascade_through_the_context_uses_the_same_networks() {
    let mut context = FaceContext::new(MockBackend::default());
    context.load(NetworkSlot::MtcnnProposal, pnet(true));
    context.load(NetworkSlot::MtcnnRefine, rnet());
    context.load(NetworkSlot::MtcnnOutput, onet());
    let image = gray(60, 60);
    let results = context
        .detect_all(&[&image, &image], &DetectorOptions::Mtcnn(MtcnnOptions::default()))
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], results[1]);
    assert!(results[0].iter().all(|face| face.landmarks.is_some()));
    assert_eq!(context.backend().live_tensors(), 0);
}

#[test]
fn sub_pixel_border_detection_does_not_sink_the_image() {
    let context = ssd_context();
    let image = gray(200, 100);
    let options = PipelineOptions {
        // maps to a box 0.4 px wide at the right border
        detector: ssd_options_with(BoundingBox::new(99.8, 20.0, 30.0, 30.0)),
        ..PipelineOptions::default()
    };
    let faces = context.analyze(&image, &options).unwrap();

    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].detection.bbox, BoundingBox::new(20.0, 20.0, 60.0, 60.0));
    assert!(faces[0].landmarks.is_some());
    assert!(faces[0].descriptor.is_some());
    assert_eq!(context.backend().live_tensors(), 0);
}

#[test]
fn attribute_stages_follow_face_order() {
    let mut context = ssd_context();
    context.load(NetworkSlot::Expression, expression_network());
    context.load(NetworkSlot::AgeGender, age_gender_network(true));
    let image = gray(200, 100);
    let mut faces = context
        .detect_all(&[&image], &ssd_options())
        .unwrap()
        .remove(0);
    assert_eq!(faces.len(), 2);

    context.with_expressions(&image, &mut faces).unwrap();
    context.with_age_and_gender(&image, &mut faces).unwrap();

    let dominant: Vec<&str> = faces
        .iter()
        .map(|f| f.expressions.as_ref().expect("expressions").dominant().0)
        .collect();
    assert_eq!(dominant, vec!["happy", "sad"]);

    let first = faces[0].age_gender.expect("age and gender");
    assert_eq!(first.age, 20.0);
    assert_eq!(first.gender, Gender::Male);
    assert!((first.gender_probability - 0.8).abs() < 1e-6);
    let second = faces[1].age_gender.expect("age and gender");
    assert_eq!(second.age, 30.0);
    assert_eq!(second.gender, Gender::Female);

    assert_eq!(context.backend().calls(), vec!["ssd", "expression", "age_gender"]);
    assert_eq!(context.backend().live_tensors(), 0);
}

#[test]
fn analyze_runs_attribute_stages_on_aligned_faces() {
    let mut context = ssd_context();
    context.load(NetworkSlot::Expression, expression_network());
    context.load(NetworkSlot::AgeGender, age_gender_network(false));
    let options = PipelineOptions {
        detector: ssd_options(),
        expressions: true,
        age_and_gender: true,
        ..PipelineOptions::default()
    };
    let faces = context.analyze(&gray(200, 100), &options).unwrap();

    assert_eq!(faces.len(), 2);
    assert!(faces.iter().all(|f| f.landmarks.is_some() && f.descriptor.is_some()));
    let ages: Vec<f32> = faces
        .iter()
        .map(|f| f.age_gender.expect("age and gender").age)
        .collect();
    assert_eq!(ages, vec![20.0, 30.0]);
    assert_eq!(
        context.backend().calls(),
        vec!["ssd", "landmarks", "recognition", "expression", "age_gender"]
    );
    assert_eq!(context.backend().live_tensors(), 0);
}

#[test]
fn failed_attribute_stage_leaves_faces_untouched() {
    let mut context = ssd_context();
    context.load(NetworkSlot::Expression, expression_network());
    context.load(NetworkSlot::AgeGender, MockNetwork::failing("age_gender"));
    let image = gray(200, 100);
    let mut faces = context
        .detect_all(&[&image], &ssd_options())
        .unwrap()
        .remove(0);
    context.with_expressions(&image, &mut faces).unwrap();
    let snapshot = faces.clone();

    let err = context.with_age_and_gender(&image, &mut faces).unwrap_err();
    assert!(matches!(&err, FaceError::Backend { network, .. } if network == "age_gender"));
    assert_eq!(faces, snapshot);
    assert!(faces.iter().all(|f| f.age_gender.is_none()));
    assert_eq!(context.backend().live_tensors(), 0);
}
