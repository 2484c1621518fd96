use clinfair::metrics::{MetricOptions, evaluate, roc_curve};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_scores(n: usize) -> (Array1<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(0x5EED_0C0 + n as u64);
    let y_true = Array1::from_shape_fn(n, |_| f64::from(u8::from(rng.gen_bool(0.2))));
    let y_pred = Array1::from_shape_fn(n, |i| {
        let noise: f64 = rng.r#gen();
        (0.6 * y_true[i] + 0.4 * noise).min(1.0)
    });
    (y_true, y_pred)
}

fn benchmark_metric_battery(c: &mut Criterion) {
    let sizes = [1_000_usize, 10_000, 100_000];
    let inputs: Vec<_> = sizes.iter().map(|&n| (n, random_scores(n))).collect();
    let options = MetricOptions::default();

    let mut group = c.benchmark_group("metric_battery");
    for (n, (y_true, y_pred)) in inputs.iter() {
        group.throughput(Throughput::Elements(*n as u64));

        group.bench_with_input(BenchmarkId::new("evaluate", n), &(y_true, y_pred), |b, input| {
            b.iter(|| {
                let result = evaluate(black_box(input.0.view()), black_box(input.1.view()), &options);
                black_box(result.is_ok());
            });
        });

        group.bench_with_input(BenchmarkId::new("roc_curve", n), &(y_true, y_pred), |b, input| {
            b.iter(|| {
                let curve = roc_curve(black_box(input.0.view()), black_box(input.1.view()));
                black_box(curve.is_ok());
            });
        });
    }
    group.finish();
}

criterion_group!(metric_battery, benchmark_metric_battery);
criterion_main!(metric_battery);
