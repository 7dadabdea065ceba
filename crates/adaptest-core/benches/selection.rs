use criterion::{black_box, criterion_group, criterion_main, Criterion};

use adaptest_core::exposure::{ExposureController, SessionContext};
use adaptest_core::model::{CatalogSnapshot, ContentArea, Item, ItemId};
use adaptest_core::selector::{ItemSelector, SessionView};

fn catalog(n: usize) -> CatalogSnapshot {
    let items = (0..n)
        .map(|i| Item {
            id: format!("item-{i:05}"),
            content_area: ContentArea::ALL[i % 5],
            difficulty: -3.0 + 6.0 * i as f64 / n as f64,
            discrimination: 0.6 + (i % 10) as f64 * 0.15,
            guessing: 0.2,
            active: true,
            exposure_count: (i % 50) as u64,
            infit: None,
            outfit: None,
        })
        .collect();
    CatalogSnapshot::new("bench", "1", items)
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_next");
    let selector = ItemSelector::default();
    let exposure = ExposureController::default();

    for n in [500, 5000] {
        let catalog = catalog(n);
        let administered: Vec<ItemId> = catalog
            .items()
            .iter()
            .step_by(n / 20)
            .map(|i| i.id.clone())
            .collect();
        group.bench_function(format!("bank={n}"), |b| {
            let mut ctx = SessionContext::new(7);
            b.iter(|| {
                let view = SessionView {
                    theta: black_box(0.4),
                    administered: &administered,
                };
                selector
                    .select_next(view, &catalog, &exposure, &mut ctx)
                    .map(|item| item.id.len())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_select);
criterion_main!(benches);
