//! Replay determinism: for any run and event prefix, two independent engine
//! invocations produce the same pending-work items, the same correlation
//! ids, and the same outcome.

use std::sync::Arc;

use futures::FutureExt;
use proptest::prelude::*;

use windlass_codec::{dehydrate, Boundary, Value};
use windlass_core::{Run, RunId, RunStatus, StepName, WorkflowName};
use windlass_engine::{replay, ReplayOutcome, WorkflowFn};

fn fan_out_workflow(width: usize) -> WorkflowFn {
    Arc::new(move |ctx, input| {
        async move {
            let step = StepName::new("./fan.ts", "work");
            let futures: Vec<_> = (0..width)
                .map(|i| ctx.step(&step, vec![input.clone(), Value::from(i as f64)]))
                .collect();
            let results = futures::future::join_all(futures).await;

            let mut total = 0.0;
            for result in results {
                total += result?.as_f64().unwrap_or(0.0);
            }
            Ok(Value::from(total))
        }
        .boxed_local()
    })
}

fn running_run(input: Value) -> Run {
    let input = dehydrate(&input, Boundary::Client, "workflow arguments").expect("encode");
    let mut run = Run::new(
        RunId::new(),
        WorkflowName::new("./flows.ts", "fanOut"),
        input,
    );
    run.status = RunStatus::Running;
    run.started_at = Some(chrono::Utc::now());
    run
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn identical_passes_for_identical_logs(
        seed in -1.0e6f64..1.0e6f64,
        width in 1usize..6,
    ) {
        let run = running_run(Value::from(seed));
        let workflow = fan_out_workflow(width);

        let a = replay(&workflow, &run, vec![]).expect("replay a");
        let b = replay(&workflow, &run, vec![]).expect("replay b");

        prop_assert!(matches!(a.outcome, ReplayOutcome::Suspended));
        prop_assert!(matches!(b.outcome, ReplayOutcome::Suspended));

        let ids_a: Vec<_> = a.pending.iter().map(|(id, _)| *id).collect();
        let ids_b: Vec<_> = b.pending.iter().map(|(id, _)| *id).collect();
        prop_assert_eq!(ids_a.len(), width);
        prop_assert_eq!(ids_a, ids_b);
        prop_assert_eq!(a.pending, b.pending);
        prop_assert_eq!(a.counts.steps, width);
    }

    #[test]
    fn different_runs_allocate_different_ids(seed in -1.0e6f64..1.0e6f64) {
        let workflow = fan_out_workflow(1);
        let a = replay(&workflow, &running_run(Value::from(seed)), vec![])
            .expect("replay a");
        let b = replay(&workflow, &running_run(Value::from(seed)), vec![])
            .expect("replay b");

        let id_a = a.pending.iter().next().map(|(id, _)| *id);
        let id_b = b.pending.iter().next().map(|(id, _)| *id);
        prop_assert_ne!(id_a, id_b);
    }
}
