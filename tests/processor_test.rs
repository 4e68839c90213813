#![cfg(feature = "testing")]

use buslink::testing::{FakeQueueClient, OpKind};
use buslink::{
    BuslinkError, EndpointConfig, ErrorHandleResult, InboundMessage, MessageProcessor,
    MessageReceiver, OnErrorFn, OnMessageFn, PipelineInvoker, ProcessingOutcome,
    PushRuntimeSettings, QueueClient, ShutdownToken, TransportTransactionMode,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(mode: TransportTransactionMode) -> EndpointConfig {
    EndpointConfig::builder("input-queue")
        .connection_string("fake-connection")
        .transaction_mode(mode)
        .build_with_env(|_| None)
        .unwrap()
}

fn message(id: Option<&str>) -> InboundMessage {
    InboundMessage::new(
        id.map(String::from),
        HashMap::new(),
        br#"{"Type":"HappyDayMessage"}"#.to_vec(),
        1,
        None,
    )
}

async fn scripted_invoker(on_message: OnMessageFn, on_error: OnErrorFn) -> Arc<PipelineInvoker> {
    let invoker = Arc::new(PipelineInvoker::new());
    invoker
        .initialize(PushRuntimeSettings::default(), on_message, on_error)
        .await
        .unwrap();
    invoker
}

fn ok_on_message() -> OnMessageFn {
    Arc::new(|_ctx| Box::pin(async { Ok(()) }))
}

fn failing_on_message(msg: &str) -> OnMessageFn {
    let msg = msg.to_string();
    Arc::new(move |_ctx| {
        let msg = msg.clone();
        Box::pin(async move { Err(BuslinkError::Handler(msg)) })
    })
}

fn on_error_returning(outcome: ErrorHandleResult) -> OnErrorFn {
    Arc::new(move |_ctx| Box::pin(async move { Ok(outcome) }))
}

// ---------------------------------------------------------------------------
// Happy day: exactly-once completion per mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_day_atomic_completes_exactly_once() {
    let queue = FakeQueueClient::new();
    let invoker =
        scripted_invoker(ok_on_message(), on_error_returning(ErrorHandleResult::Handled)).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    );

    let outcome = processor
        .process(message(Some("m-1")), &ShutdownToken::never())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::Completed);

    let completes = queue.complete_calls();
    assert_eq!(completes.len(), 1);
    assert!(completes[0].is_effective(), "completion must be committed");
    assert!(completes[0].transaction_id().is_some());
    assert!(queue.abandon_calls().is_empty());
}

#[tokio::test]
async fn happy_day_receive_only_completes_exactly_once() {
    let queue = FakeQueueClient::new();
    let invoker =
        scripted_invoker(ok_on_message(), on_error_returning(ErrorHandleResult::Handled)).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::ReceiveOnly),
        invoker,
        queue.share(),
    );

    let outcome = processor
        .process(message(Some("m-1")), &ShutdownToken::never())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::Completed);

    let completes = queue.complete_calls();
    assert_eq!(completes.len(), 1);
    // Receive-only completion is unconditional, outside any transaction.
    assert!(completes[0].transaction_id().is_none());
    assert!(completes[0].is_effective());
}

#[tokio::test]
async fn none_mode_never_touches_host_primitives() {
    let queue = FakeQueueClient::new();
    let invoker =
        scripted_invoker(ok_on_message(), on_error_returning(ErrorHandleResult::Handled)).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::None),
        invoker,
        queue.share(),
    );

    let outcome = processor
        .process(message(Some("m-1")), &ShutdownToken::never())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::Completed);
    assert!(queue.ops().is_empty());
}

// ---------------------------------------------------------------------------
// Missing message id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generated_message_id_is_consistent_across_contexts() {
    let queue = FakeQueueClient::new();
    let seen_in_message = Arc::new(Mutex::new(String::new()));
    let seen_in_error = Arc::new(Mutex::new(String::new()));

    let seen = seen_in_message.clone();
    let on_message: OnMessageFn = Arc::new(move |ctx| {
        let seen = seen.clone();
        Box::pin(async move {
            *seen.lock().unwrap() = ctx.message_id.clone();
            Err(BuslinkError::Handler("force error path".into()))
        })
    });

    let seen = seen_in_error.clone();
    let on_error: OnErrorFn = Arc::new(move |ctx| {
        let seen = seen.clone();
        Box::pin(async move {
            *seen.lock().unwrap() = ctx.message_id.clone();
            Ok(ErrorHandleResult::Handled)
        })
    });

    let invoker = scripted_invoker(on_message, on_error).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::ReceiveOnly),
        invoker,
        queue.share(),
    );

    processor
        .process(message(None), &ShutdownToken::never())
        .await
        .unwrap();

    let main_id = seen_in_message.lock().unwrap().clone();
    let error_id = seen_in_error.lock().unwrap().clone();
    assert!(!main_id.is_empty());
    assert_eq!(main_id, error_id);
    assert_eq!(queue.complete_calls()[0].message_id, main_id);
}

// ---------------------------------------------------------------------------
// Error pipeline handles the failure: fresh transaction, single completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handled_failure_completes_under_fresh_transaction() {
    let queue = FakeQueueClient::new();
    let main_tx_id = Arc::new(AtomicU64::new(0));
    let error_tx_id = Arc::new(AtomicU64::new(0));

    let main_tx = main_tx_id.clone();
    let on_message: OnMessageFn = Arc::new(move |ctx| {
        let main_tx = main_tx.clone();
        Box::pin(async move {
            let tx = ctx.transport_transaction.transaction().unwrap();
            main_tx.store(tx.id(), Ordering::SeqCst);
            Err(BuslinkError::Handler("SimulatedException".into()))
        })
    });

    let error_tx = error_tx_id.clone();
    let on_error: OnErrorFn = Arc::new(move |ctx| {
        let error_tx = error_tx.clone();
        Box::pin(async move {
            let tx = ctx.transport_transaction.transaction().unwrap();
            error_tx.store(tx.id(), Ordering::SeqCst);
            Ok(ErrorHandleResult::Handled)
        })
    });

    let invoker = scripted_invoker(on_message, on_error).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    );

    let outcome = processor
        .process(message(Some("m-err")), &ShutdownToken::never())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::HandledByErrorPipeline);

    // The error pipeline ran under a different transaction instance.
    let main_id = main_tx_id.load(Ordering::SeqCst);
    let error_id = error_tx_id.load(Ordering::SeqCst);
    assert_ne!(main_id, 0);
    assert_ne!(error_id, 0);
    assert_ne!(main_id, error_id);

    // Completed exactly once, under the new transaction.
    let completes = queue.complete_calls();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].transaction_id(), Some(error_id));
    assert!(completes[0].is_effective());
}

// ---------------------------------------------------------------------------
// Retry required: original error rethrown, nothing completed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_required_rethrows_original_without_completion() {
    let queue = FakeQueueClient::new();
    let invoker = scripted_invoker(
        failing_on_message("SimulatedException"),
        on_error_returning(ErrorHandleResult::RetryRequired),
    )
    .await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::ReceiveOnly),
        invoker,
        queue.share(),
    );

    let err = processor
        .process(message(Some("m-retry")), &ShutdownToken::never())
        .await
        .unwrap_err();

    // The original error, not a wrapped one.
    assert!(matches!(err, BuslinkError::Handler(m) if m == "SimulatedException"));
    assert!(queue.complete_calls().is_empty());
    // Receive-only mode leaves redelivery to the host, no explicit abandon.
    assert!(queue.abandon_calls().is_empty());
}

#[tokio::test]
async fn retry_required_atomic_abandons_outside_transaction() {
    let queue = FakeQueueClient::new();
    let invoker = scripted_invoker(
        failing_on_message("SimulatedException"),
        on_error_returning(ErrorHandleResult::RetryRequired),
    )
    .await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    );

    let err = processor
        .process(message(Some("m-retry")), &ShutdownToken::never())
        .await
        .unwrap_err();

    assert!(matches!(err, BuslinkError::Handler(m) if m == "SimulatedException"));
    assert!(queue.complete_calls().is_empty());

    let abandons = queue.abandon_calls();
    assert_eq!(abandons.len(), 1);
    // Abandon runs outside any transaction so nothing can roll it back.
    assert!(abandons[0].transaction_id().is_none());
    assert!(abandons[0].is_effective());
}

// ---------------------------------------------------------------------------
// Error pipeline failure propagates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_pipeline_failure_propagates_the_new_error() {
    let queue = FakeQueueClient::new();
    let on_error: OnErrorFn = Arc::new(|_ctx| {
        Box::pin(async { Err(BuslinkError::Handler("error pipeline exploded".into())) })
    });
    let invoker = scripted_invoker(failing_on_message("original failure"), on_error).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    );

    let err = processor
        .process(message(Some("m-explode")), &ShutdownToken::never())
        .await
        .unwrap_err();

    // The new error reaches the host, not the original.
    assert!(matches!(err, BuslinkError::Handler(m) if m == "error pipeline exploded"));
    assert!(queue.complete_calls().is_empty());
    assert!(queue.abandon_calls().is_empty());
}

// ---------------------------------------------------------------------------
// Atomicity of sends and receive completion
// ---------------------------------------------------------------------------

fn sending_handler(fail_after_send: bool) -> OnMessageFn {
    Arc::new(move |ctx| {
        Box::pin(async move {
            let queue = ctx
                .transport_transaction
                .get::<Arc<dyn QueueClient>>()
                .expect("atomic mode enlists the queue client")
                .clone();
            queue
                .send_message(
                    "downstream",
                    HashMap::new(),
                    b"outgoing".to_vec(),
                    ctx.transport_transaction.transaction(),
                )
                .await?;

            if fail_after_send {
                Err(BuslinkError::Handler("crash after send".into()))
            } else {
                Ok(())
            }
        })
    })
}

#[tokio::test]
async fn uncommitted_attempt_shows_neither_send_nor_completion() {
    let queue = FakeQueueClient::new();
    let invoker = scripted_invoker(
        sending_handler(true),
        on_error_returning(ErrorHandleResult::RetryRequired),
    )
    .await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    );

    let _ = processor
        .process(message(Some("m-atomic")), &ShutdownToken::never())
        .await
        .unwrap_err();

    // The send was issued but its transaction never committed: replaying the
    // scenario shows neither the send nor a completion took effect.
    assert_eq!(queue.send_calls().len(), 1);
    let effective: Vec<_> = queue
        .effective_ops()
        .into_iter()
        .filter(|op| op.kind != OpKind::Abandon)
        .collect();
    assert!(effective.is_empty(), "no transactional effect may be visible");
}

#[tokio::test]
async fn committed_attempt_shows_send_and_completion_together() {
    let queue = FakeQueueClient::new();
    let invoker = scripted_invoker(
        sending_handler(false),
        on_error_returning(ErrorHandleResult::Handled),
    )
    .await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    );

    processor
        .process(message(Some("m-atomic")), &ShutdownToken::never())
        .await
        .unwrap();

    let effective = queue.effective_ops();
    assert_eq!(effective.len(), 2);
    assert!(effective.iter().any(|op| op.kind == OpKind::Send));
    assert!(effective.iter().any(|op| op.kind == OpKind::Complete));

    // Both enlisted in the same transaction.
    let tx_ids: Vec<_> = effective.iter().map(|op| op.transaction_id()).collect();
    assert_eq!(tx_ids[0], tx_ids[1]);
}

// ---------------------------------------------------------------------------
// Send-only misuse
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_only_endpoint_rejects_processing_without_opening_a_transaction() {
    let queue = FakeQueueClient::new();
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let calls = handler_calls.clone();
    let on_message: OnMessageFn = Arc::new(move |_ctx| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });
    let invoker =
        scripted_invoker(on_message, on_error_returning(ErrorHandleResult::Handled)).await;

    let send_only_config = EndpointConfig::builder("input-queue")
        .connection_string("fake-connection")
        .transaction_mode(TransportTransactionMode::SendsAtomicWithReceive)
        .send_only()
        .build_with_env(|_| None)
        .unwrap();
    let processor = MessageProcessor::new(&send_only_config, invoker, queue.share());

    let err = processor
        .process(message(Some("m-sendonly")), &ShutdownToken::never())
        .await
        .unwrap_err();

    assert!(matches!(&err, BuslinkError::InvalidOperation(m) if m.contains("send-only")));
    assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
    assert!(queue.ops().is_empty());
}

// ---------------------------------------------------------------------------
// Outbox + atomic mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outbox_with_atomic_mode_is_rejected_before_any_work() {
    let queue = FakeQueueClient::new();
    let invoker =
        scripted_invoker(ok_on_message(), on_error_returning(ErrorHandleResult::Handled)).await;

    let outbox_config = EndpointConfig::builder("input-queue")
        .connection_string("fake-connection")
        .transaction_mode(TransportTransactionMode::SendsAtomicWithReceive)
        .enable_outbox()
        .build_with_env(|_| None)
        .unwrap();
    let processor = MessageProcessor::new(&outbox_config, invoker, queue.share());

    let err = processor
        .process(message(Some("m-outbox")), &ShutdownToken::never())
        .await
        .unwrap_err();

    assert!(matches!(&err, BuslinkError::InvalidOperation(m) if m.contains("outbox")));
    assert!(queue.ops().is_empty());
}

#[tokio::test]
async fn outbox_without_atomic_mode_is_allowed() {
    let queue = FakeQueueClient::new();
    let invoker =
        scripted_invoker(ok_on_message(), on_error_returning(ErrorHandleResult::Handled)).await;

    let outbox_config = EndpointConfig::builder("input-queue")
        .connection_string("fake-connection")
        .transaction_mode(TransportTransactionMode::ReceiveOnly)
        .enable_outbox()
        .build_with_env(|_| None)
        .unwrap();
    let processor = MessageProcessor::new(&outbox_config, invoker, queue.share());

    let outcome = processor
        .process(message(Some("m-outbox-ok")), &ShutdownToken::never())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessingOutcome::Completed);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_cancellation_skips_the_error_pipeline() {
    let queue = FakeQueueClient::new();
    let error_calls = Arc::new(AtomicUsize::new(0));

    let on_message: OnMessageFn = Arc::new(|_ctx| Box::pin(async { Err(BuslinkError::Cancelled) }));
    let calls = error_calls.clone();
    let on_error: OnErrorFn = Arc::new(move |_ctx| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ErrorHandleResult::Handled)
        })
    });

    let invoker = scripted_invoker(on_message, on_error).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::ReceiveOnly),
        invoker,
        queue.share(),
    );

    let (signal, token) = buslink::shutdown_channel();
    signal.shutdown();

    let err = processor
        .process(message(Some("m-shutdown")), &token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    // Not a processing failure: the message is left for redelivery.
    assert_eq!(error_calls.load(Ordering::SeqCst), 0);
    assert!(queue.ops().is_empty());
}

#[tokio::test]
async fn cancellation_without_shutdown_is_an_ordinary_failure() {
    let queue = FakeQueueClient::new();
    let error_calls = Arc::new(AtomicUsize::new(0));

    let on_message: OnMessageFn = Arc::new(|_ctx| Box::pin(async { Err(BuslinkError::Cancelled) }));
    let calls = error_calls.clone();
    let on_error: OnErrorFn = Arc::new(move |_ctx| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ErrorHandleResult::Handled)
        })
    });

    let invoker = scripted_invoker(on_message, on_error).await;
    let processor = MessageProcessor::new(
        &config(TransportTransactionMode::ReceiveOnly),
        invoker,
        queue.share(),
    );

    let outcome = processor
        .process(message(Some("m-stray-cancel")), &ShutdownToken::never())
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::HandledByErrorPipeline);
    assert_eq!(error_calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Concurrency: independent messages, independent transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_messages_use_distinct_transactions() {
    let queue = FakeQueueClient::new();
    let invoker =
        scripted_invoker(ok_on_message(), on_error_returning(ErrorHandleResult::Handled)).await;
    let processor = Arc::new(MessageProcessor::new(
        &config(TransportTransactionMode::SendsAtomicWithReceive),
        invoker,
        queue.share(),
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move {
            processor
                .process(message(Some(&format!("m-{i}"))), &ShutdownToken::never())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let completes = queue.complete_calls();
    assert_eq!(completes.len(), 8);

    let mut tx_ids: Vec<_> = completes.iter().filter_map(|op| op.transaction_id()).collect();
    tx_ids.sort_unstable();
    tx_ids.dedup();
    assert_eq!(tx_ids.len(), 8, "transactions are never shared across messages");
}
