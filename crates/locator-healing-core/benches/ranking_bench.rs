use criterion::{criterion_group, criterion_main, Criterion};
use locator_healing_core::{
    derive_healing_id, rank_healings, Healing, HealingResult, HealingResultId, Locator, Selector,
    SelectorId,
};
use time::OffsetDateTime;

fn mk_selector(index: usize) -> Selector {
    Selector {
        selector_id: SelectorId(format!("selector-{index}")),
        class_name: format!("SuiteTest{}", index % 7),
        method_name: format!("testCase{index}"),
        locator: Locator::new("css", format!("#original-{index}")),
        url: "http://localhost/bench".to_string(),
        command: "findElement".to_string(),
        created_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn mk_healings(selectors: usize, attempts: usize, candidates: usize) -> Vec<Healing> {
    let mut healings = Vec::with_capacity(selectors * attempts);
    for selector_index in 0..selectors {
        let selector = mk_selector(selector_index);
        for attempt in 0..attempts {
            let page_content = format!("<html><body data-attempt=\"{attempt}\"></body></html>");
            let healing_id = derive_healing_id(&selector.selector_id, &page_content);
            let results = (0..candidates)
                .map(|candidate| {
                    let raw_score = u32::try_from((candidate * 37 + attempt * 11) % 100);
                    HealingResult {
                        healing_result_id: HealingResultId::new(),
                        healing_id: healing_id.clone(),
                        locator: Locator::new("css", format!("#candidate-{}", candidate % 12)),
                        score: f64::from(raw_score.unwrap_or(0)) / 100.0,
                        success: None,
                        superseded: false,
                        created_at: OffsetDateTime::UNIX_EPOCH,
                    }
                })
                .collect();
            healings.push(Healing {
                healing_id,
                selector: selector.clone(),
                page_content,
                created_at: OffsetDateTime::UNIX_EPOCH,
                results,
            });
        }
    }
    healings
}

fn bench_ranking(c: &mut Criterion) {
    let small = mk_healings(10, 5, 8);
    let large = mk_healings(200, 10, 20);

    c.bench_function("rank_healings_10x5x8", |b| b.iter(|| rank_healings(&small)));
    c.bench_function("rank_healings_200x10x20", |b| b.iter(|| rank_healings(&large)));
}

criterion_group!(benches, bench_ranking);
criterion_main!(benches);
