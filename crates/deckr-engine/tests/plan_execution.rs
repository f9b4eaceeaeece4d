use deckr_engine::{
    BackendError, EngineConfig, EngineError, ErrorKind, NormalizationError, PlanError,
    ReviewState, SlideId, UnitSuccess,
};
use deckr_test_utils::{
    deck, no_plan, normalize_ref, session, CallKind, ScriptedBackend, StaticPlanner,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn id(s: &str) -> SlideId {
    SlideId::new(s)
}

#[tokio::test]
async fn test_edit_and_add_plan_produces_reviewable_candidates() {
    let backend = Arc::new(ScriptedBackend::new(3));
    let session = session(&EngineConfig::default(), deck(&["A", "B"]), no_plan(), backend.clone());

    let report = session
        .submit_plan(
            &json!({
                "tasks": [
                    { "type": "EDIT_SLIDE", "slideId": "A", "detailed_prompt": "make title bold" },
                    {
                        "type": "ADD_SLIDE",
                        "insertAfterSlideId": "B",
                        "newSlideName": "Summary",
                        "detailed_prompt": "add summary"
                    }
                ]
            }),
            false,
        )
        .await
        .unwrap();
    assert!(report.all_succeeded());

    let slides = session.deck().snapshot().await.unwrap();
    assert_eq!(slides.len(), 3);

    let a = &slides[0];
    assert_eq!(a.id(), &id("A"));
    assert_eq!(a.pending().unwrap().variations.len(), 3);
    assert_eq!(a.pending().unwrap().variation_prompts.len(), 3);
    assert_eq!(a.history().len(), 1);

    let added = &slides[2];
    assert_eq!(added.name(), "Summary");
    assert_eq!(added.history().len(), 1);
    assert_eq!(added.pending().unwrap().variations.len(), 3);

    let create = &backend.calls_of(CallKind::Create)[0];
    assert_eq!(added.original(), &normalize_ref(&create.returned[0]));
    assert_eq!(&create.base, slides[0].current());

    assert_eq!(report.added_slides(), vec![added.id()]);
    assert!(session.in_flight().is_empty());
}

#[tokio::test]
async fn test_one_failing_task_does_not_block_siblings() {
    let backend = Arc::new(ScriptedBackend::new(2).failing_on_prompt("boom"));
    let session = session(
        &EngineConfig::default(),
        deck(&["a", "b", "c", "d"]),
        no_plan(),
        backend,
    );

    let tasks: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|s| {
            let prompt = if *s == "c" { "boom" } else { "tidy" };
            json!({ "type": "EDIT_SLIDE", "slideId": s, "detailed_prompt": prompt })
        })
        .collect();
    let report = session.submit_plan(&json!({ "tasks": tasks }), false).await.unwrap();

    assert_eq!(report.failed_targets(), vec![&id("c")]);
    assert_eq!(report.successes().count(), 3);

    let slides = session.deck().snapshot().await.unwrap();
    let pending: Vec<&str> = slides
        .iter()
        .filter(|s| s.pending().is_some())
        .map(|s| s.id().as_str())
        .collect();
    assert_eq!(pending, vec!["a", "b", "d"]);

    let failure = report.failures().next().unwrap();
    assert_eq!(failure.error.kind(), ErrorKind::GenerativeBackendFailure);
    assert_eq!(
        failure.user_message(),
        "Couldn't update \"Slide c\": generation failed: backend call failed: scripted failure for 'boom'"
    );
}

#[tokio::test]
async fn test_missing_slide_is_scoped_to_its_task() {
    let backend = Arc::new(ScriptedBackend::new(1));
    let session = session(&EngineConfig::default(), deck(&["a"]), no_plan(), backend.clone());

    let report = session
        .submit_plan(
            &json!({
                "tasks": [
                    { "type": "EDIT_SLIDE", "slideId": "ghost", "detailed_prompt": "x" },
                    { "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "x" }
                ]
            }),
            false,
        )
        .await
        .unwrap();

    assert_eq!(report.failed_targets(), vec![&id("ghost")]);
    let failure = report.failures().next().unwrap();
    assert_eq!(failure.error.kind(), ErrorKind::ReferenceNotFound);
    assert!(failure.slide_name.is_none());
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_add_slide_on_empty_deck_fails_with_empty_deck() {
    let backend = Arc::new(ScriptedBackend::new(1));
    let session = session(&EngineConfig::default(), Vec::new(), no_plan(), backend);

    let report = session
        .submit_plan(
            &json!({ "tasks": [{ "type": "ADD_SLIDE", "insertAfterSlideId": "x", "detailed_prompt": "intro" }] }),
            false,
        )
        .await
        .unwrap();

    let failure = report.failures().next().unwrap();
    assert_eq!(failure.target, id("x"));
    assert!(matches!(failure.error, EngineError::EmptyDeck));
    assert_eq!(failure.slide_name.as_deref(), Some("New Slide"));
}

#[tokio::test]
async fn test_add_slide_with_missing_anchor_appends() {
    let backend = Arc::new(ScriptedBackend::new(1));
    let session = session(&EngineConfig::default(), deck(&["a", "b"]), no_plan(), backend);

    let report = session
        .submit_plan(
            &json!({ "tasks": [{ "type": "ADD_SLIDE", "insertAfterSlideId": "gone", "detailed_prompt": "outro" }] }),
            false,
        )
        .await
        .unwrap();

    assert!(matches!(
        report.successes().next(),
        Some(UnitSuccess::SlideAdded { index: 2, .. })
    ));
}

#[tokio::test]
async fn test_rejected_plans_touch_nothing() {
    let backend = Arc::new(ScriptedBackend::new(3));
    let session = session(&EngineConfig::default(), deck(&["a", "b"]), no_plan(), backend.clone());
    let before = session.deck().snapshot().await.unwrap();

    let invalid = session
        .submit_plan(
            &json!({
                "tasks": [
                    { "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "x" },
                    { "type": "REORDER", "slideId": "b", "detailed_prompt": "x" }
                ]
            }),
            false,
        )
        .await
        .unwrap_err();
    let empty = session.submit_plan(&json!({ "tasks": [] }), false).await.unwrap_err();

    assert_eq!(invalid.kind(), ErrorKind::PlanStructurallyInvalid);
    assert_eq!(empty.kind(), ErrorKind::PlanHasNoActionableTasks);
    assert!(matches!(empty, EngineError::Plan(PlanError::NoActionableTasks)));
    assert_eq!(session.deck().snapshot().await.unwrap(), before);
    assert!(backend.calls().is_empty());
    assert!(session.current_plan().is_none());
}

#[tokio::test]
async fn test_request_goes_through_planner_with_summaries() {
    let planner = Arc::new(StaticPlanner::new(json!({
        "tasks": [{ "type": "EDIT_SLIDE", "slideId": "b", "detailed_prompt": "bigger chart" }]
    })));
    let backend = Arc::new(ScriptedBackend::new(2));
    let session = session(&EngineConfig::default(), deck(&["a", "b"]), planner.clone(), backend);

    let report = session.submit_request("make the chart bigger", true).await.unwrap();
    assert!(report.all_succeeded());

    let requests = planner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "make the chart bigger");
    let names: Vec<_> = requests[0].1.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Slide a", "Slide b"]);
}

#[tokio::test]
async fn test_targets_are_in_flight_until_settled() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::new(1).gated(gate.clone()));
    let session = Arc::new(session(
        &EngineConfig::default(),
        deck(&["a", "b"]),
        no_plan(),
        backend,
    ));

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .submit_plan(
                    &json!({
                        "tasks": [
                            { "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "x" },
                            { "type": "ADD_SLIDE", "insertAfterSlideId": "b", "detailed_prompt": "y" }
                        ]
                    }),
                    false,
                )
                .await
        })
    };

    for _ in 0..100 {
        if session.in_flight().len() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(session.in_flight(), vec![id("a"), id("b")]);
    assert!(session.current_plan().is_some());

    gate.add_permits(2);
    let report = running.await.unwrap().unwrap();
    assert!(report.all_succeeded());
    assert!(session.in_flight().is_empty());
    assert!(session.current_plan().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hung_backend_call_times_out() {
    let config = EngineConfig::default().with_generation_timeout(Duration::from_secs(5));
    let backend = Arc::new(ScriptedBackend::new(2).hanging_on_prompt("slow"));
    let session = session(&config, deck(&["a", "b"]), no_plan(), backend);

    let report = session
        .submit_plan(
            &json!({
                "tasks": [
                    { "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "slow" },
                    { "type": "EDIT_SLIDE", "slideId": "b", "detailed_prompt": "fast" }
                ]
            }),
            false,
        )
        .await
        .unwrap();

    assert_eq!(report.failed_targets(), vec![&id("a")]);
    assert!(matches!(
        report.failures().next().unwrap().error,
        EngineError::Backend(BackendError::Timeout { duration_secs: 5 })
    ));
    assert!(session.in_flight().is_empty());
}

#[tokio::test]
async fn test_failed_unit_drops_earlier_pending_bundle() {
    let backend = Arc::new(ScriptedBackend::new(2).failing_on_prompt("boom"));
    let session = session(&EngineConfig::default(), deck(&["a", "b"]), no_plan(), backend);

    let first = session
        .submit_plan(
            &json!({ "tasks": [{ "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "first" }] }),
            false,
        )
        .await
        .unwrap();
    assert!(first.all_succeeded());
    let a = session.deck().require_slide(&id("a")).await.unwrap();
    assert_eq!(a.pending().unwrap().task_prompt, "first");

    let second = session
        .submit_plan(
            &json!({
                "tasks": [
                    { "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "boom" },
                    { "type": "EDIT_SLIDE", "slideId": "b", "detailed_prompt": "tidy" }
                ]
            }),
            false,
        )
        .await
        .unwrap();
    assert_eq!(second.failed_targets(), vec![&id("a")]);

    let a = session.deck().require_slide(&id("a")).await.unwrap();
    assert!(a.pending().is_none());
    assert_eq!(a.history().len(), 1);
    assert_eq!(session.review_state(&id("a")).await.unwrap(), ReviewState::Idle);
    let b = session.deck().require_slide(&id("b")).await.unwrap();
    assert_eq!(b.pending().unwrap().task_prompt, "tidy");
}

#[tokio::test]
async fn test_undecodable_candidates_fail_only_their_unit() {
    let backend = Arc::new(ScriptedBackend::new(3).returning_garbage_on_prompt("noise"));
    let session = session(&EngineConfig::default(), deck(&["a", "b", "c"]), no_plan(), backend);

    let report = session
        .submit_plan(
            &json!({
                "tasks": [
                    { "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "noise" },
                    { "type": "EDIT_SLIDE", "slideId": "b", "detailed_prompt": "tidy" },
                    { "type": "ADD_SLIDE", "insertAfterSlideId": "c", "detailed_prompt": "outro" }
                ]
            }),
            false,
        )
        .await
        .unwrap();

    assert_eq!(report.failed_targets(), vec![&id("a")]);
    let failure = report.failures().next().unwrap();
    assert_eq!(failure.error.kind(), ErrorKind::ImageNormalizationFailure);
    assert!(matches!(
        failure.error,
        EngineError::Normalization(NormalizationError::LoadFailure(_))
    ));
    assert_eq!(failure.slide_name.as_deref(), Some("Slide a"));

    let slides = session.deck().snapshot().await.unwrap();
    assert_eq!(slides.len(), 4);
    assert!(slides[0].pending().is_none());
    assert_eq!(slides[1].pending().unwrap().len(), 3);
    assert_eq!(slides[3].pending().unwrap().len(), 3);
    assert!(session.in_flight().is_empty());
}

#[tokio::test]
async fn test_undecodable_candidate_is_dropped_with_its_prompt() {
    let backend = Arc::new(ScriptedBackend::new(3).garbling_candidate("tidy", 1));
    let session = session(&EngineConfig::default(), deck(&["a"]), no_plan(), backend.clone());

    let report = session
        .submit_plan(
            &json!({ "tasks": [{ "type": "EDIT_SLIDE", "slideId": "a", "detailed_prompt": "tidy" }] }),
            false,
        )
        .await
        .unwrap();
    assert!(matches!(
        report.successes().next(),
        Some(UnitSuccess::PendingAttached { variations: 2, .. })
    ));

    let a = session.deck().require_slide(&id("a")).await.unwrap();
    let pending = a.pending().unwrap();
    let returned = &backend.calls_of(CallKind::Edit)[0].returned;
    assert_eq!(
        pending.variations,
        vec![normalize_ref(&returned[0]), normalize_ref(&returned[2])]
    );
    assert_eq!(
        pending.variation_prompts,
        vec!["tidy (variation 1)", "tidy (variation 3)"]
    );
}

#[tokio::test]
async fn test_overlapping_plans_keep_the_latest_as_current() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::new(1).gated(gate.clone()).hanging_on_prompt("slow"));
    let session = Arc::new(session(
        &EngineConfig::default(),
        deck(&["a", "b"]),
        no_plan(),
        backend,
    ));

    let submit = |slide: &'static str, prompt: &'static str| {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .submit_plan(
                    &json!({ "tasks": [{ "type": "EDIT_SLIDE", "slideId": slide, "detailed_prompt": prompt }] }),
                    false,
                )
                .await
        })
    };

    let earlier = submit("a", "fast");
    for _ in 0..100 {
        if session.in_flight() == vec![id("a")] {
            break;
        }
        tokio::task::yield_now().await;
    }
    let later = submit("b", "slow");
    for _ in 0..100 {
        if session.in_flight().len() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(session.in_flight(), vec![id("a"), id("b")]);

    gate.add_permits(2);
    assert!(earlier.await.unwrap().unwrap().all_succeeded());

    let current = session.current_plan().unwrap();
    assert_eq!(current.tasks()[0].target(), &id("b"));
    assert_eq!(session.in_flight(), vec![id("b")]);

    later.abort();
}
