//! Property: map results line up with their inputs whatever order the
//! elements finish in.

use proptest::prelude::*;
use serde_json::json;

use weft_core::types::FunctionSpec;
use weft_engine::task_fn;
use weft_test_utils::test_engine;

fn arb_items() -> impl Strategy<Value = Vec<(i64, u64)>> {
    prop::collection::vec((any::<i32>().prop_map(i64::from), 0u64..20), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn map_output_is_index_aligned(items in arb_items()) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let outcomes = runtime.block_on(async {
            let engine = test_engine();
            let negate = engine.register(
                FunctionSpec::new("negate"),
                task_fn(|input, _ctx| async move {
                    let delay = input["delay_ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    Ok(json!(-input["n"].as_i64().unwrap_or(0)))
                }),
            );
            let inputs = items
                .iter()
                .map(|(n, delay)| json!({"n": n, "delay_ms": delay}))
                .collect();
            engine.scope("aligned").map(&negate, inputs).await.unwrap()
        });

        prop_assert_eq!(outcomes.len(), items.len());
        for (outcome, (n, _)) in outcomes.iter().zip(&items) {
            prop_assert_eq!(outcome.value(), Some(&json!(-n)));
        }
    }
}
