use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use facelens_core::decode::{
    BoxCoder, Candidate, GridHead, ScoreActivation, decode_anchor_boxes, decode_grid,
};
use facelens_core::detector::ssd::ssd_mobilenet_anchors;
use facelens_core::geometry::BoundingBox;
use facelens_core::nms::non_max_suppression;
use facelens_utils::OverlapMetric;
use ndarray::{Array2, Array3};

/// Deterministic clustered candidates: groups of overlapping boxes on a grid.
fn clustered_candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| {
            let cluster = i / 8;
            let jitter = (i % 8) as f32;
            let x = (cluster % 16) as f32 * 40.0 + jitter;
            let y = (cluster / 16) as f32 * 40.0 + jitter * 0.5;
            let score = 0.5 + ((i * 37) % 50) as f32 / 100.0;
            Candidate::new(BoundingBox::new(x, y, 32.0, 32.0), score)
        })
        .collect()
}

fn benchmark_nms(c: &mut Criterion) {
    let mut group = c.benchmark_group("non_max_suppression");
    for count in [64usize, 256, 1024] {
        let candidates = clustered_candidates(count);
        for (label, metric) in [("union", OverlapMetric::Union), ("min", OverlapMetric::Min)] {
            group.bench_with_input(BenchmarkId::new(label, count), &candidates, |b, input| {
                b.iter(|| non_max_suppression(black_box(input.clone()), 0.5, metric, Some(100)));
            });
        }
    }
    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let anchors = ssd_mobilenet_anchors(512);
    let regression = Array2::<f32>::from_shape_fn((anchors.len(), 4), |(i, j)| {
        ((i * 7 + j * 3) % 11) as f32 / 11.0 - 0.5
    });
    let scores = Array2::<f32>::from_shape_fn((anchors.len(), 1), |(i, _)| {
        ((i * 13) % 17) as f32 / 4.0 - 2.0
    });
    c.bench_function("decode_anchor_boxes_ssd512", |b| {
        b.iter(|| {
            decode_anchor_boxes(
                black_box(regression.view()),
                black_box(scores.view()),
                &anchors,
                &BoxCoder::SSD_MOBILENET,
                ScoreActivation::Sigmoid,
                0.5,
            )
            .expect("anchor decode should succeed")
        });
    });

    let head = GridHead::tiny_face();
    let channels = head.anchors.len() * (5 + head.num_classes);
    let grid = Array3::<f32>::from_shape_fn((13, 13, channels), |(y, x, c)| {
        ((y * 5 + x * 3 + c) % 9) as f32 / 3.0 - 1.5
    });
    c.bench_function("decode_grid_tiny416", |b| {
        b.iter(|| decode_grid(black_box(grid.view()), &head, 0.5).expect("grid decode should succeed"));
    });
}

criterion_group!(benches, benchmark_nms, benchmark_decode);
criterion_main!(benches);
