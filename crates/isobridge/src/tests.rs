use std::sync::Arc;
use std::time::Duration;

use isowire::Complete;
use isowire::ErrorPayload;
use isowire::FaultKind;
use isowire::Identifier;
use isowire::Message;
use isowire::Ping;
use isowire::Request;
use isowire::Response;
use isowire::Role;
use isowire::SubjectRef;
use isowire::ValueUpdate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::client;
use crate::client::Client;
use crate::config::ClientConfig;
use crate::config::RouterConfig;
use crate::host::Host;
use crate::host::ServiceTable;
use crate::hub;
use crate::hub::SubjectManager;
use crate::mock_transport::RecordingTransport;
use crate::router::Router;
use crate::service::Fault;
use crate::service::ServiceBuilder;
use crate::transport::Address;
use crate::transport::EndpointId;

const ICOUNTER: Identifier = Identifier::new("ICounter", Role::Background);
const IMATH: Identifier = Identifier::new("IMath", Role::Background).with_methods(&["add", "fail", "explode"]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

fn update(key: &str, value: i64) -> Message {
    Message::ValueUpdate(ValueUpdate {
        key: key.to_string(),
        value: json!({ "value": value }),
    })
}

fn math() -> crate::service::MethodTable {
    ServiceBuilder::new()
        .method_sync("add", |(a, b): (i64, i64), _ctx| Ok(a + b))
        .method_sync("fail", |(): (), _ctx| -> anyhow::Result<()> {
            Err(Fault::new("RangeError", "out of range").into())
        })
        .method_sync("explode", |(): (), _ctx| -> anyhow::Result<()> { panic!("kaboom") })
        .build()
}

fn request(id: &str, service: &str, method: &str, args: Vec<Value>) -> Request {
    Request {
        id: id.to_string(),
        service: service.to_string(),
        method: method.to_string(),
        args,
        to: Role::Background,
        from: Role::Content,
    }
}

/// Polls until `peer` has been sent something, yielding to spawned tasks.
async fn wait_for(transport: &RecordingTransport, peer: u64) -> Vec<Message> {
    for _ in 0..200 {
        let sent = transport.take_for(peer);
        if !sent.is_empty() {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("nothing sent to endpoint {}", peer);
}

/// Polls until the transport has sent anything at all.
async fn wait_any(transport: &RecordingTransport) -> Vec<(Address, Message)> {
    for _ in 0..200 {
        let sent = transport.take();
        if !sent.is_empty() {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("nothing sent");
}

// --- hub ---

#[test]
fn test_pending_subscribers_get_initial_value_once() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());

    let key = "ICounter-main";
    for origin in [7, 8, 7] {
        transport.inject(origin, Message::Subscribe(SubjectRef { key: key.to_string() }));
    }
    assert_eq!(hub.pending_subscribers(key), vec![EndpointId(7), EndpointId(8)]);
    assert!(transport.take().is_empty());

    let _subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 1 }).unwrap();

    assert_eq!(transport.take_for(7), vec![update(key, 1)]);
    assert_eq!(transport.take_for(8), vec![update(key, 1)]);
    assert!(hub.pending_subscribers(key).is_empty());
    assert_eq!(hub.active_subscribers(key), vec![EndpointId(7), EndpointId(8)]);

    // endpoint 7 subscribed twice while pending, so one unsubscribe keeps it
    hub.unsubscribe(key, EndpointId(7));
    assert_eq!(hub.active_subscribers(key), vec![EndpointId(7), EndpointId(8)]);
    hub.unsubscribe(key, EndpointId(7));
    assert_eq!(hub.active_subscribers(key), vec![EndpointId(8)]);
}

#[test]
fn test_later_subscriber_sees_current_value_then_updates() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 0 }).unwrap();

    hub.subscribe(subject.key(), EndpointId(4));
    subject.next(&Counter { value: 5 }).unwrap();

    assert_eq!(
        transport.take_for(4),
        vec![update("ICounter-main", 0), update("ICounter-main", 5)]
    );
    assert_eq!(subject.value().unwrap(), Some(Counter { value: 5 }));
}

#[test]
fn test_shared_endpoint_gets_a_push_per_subscribe_and_leaves_at_zero() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 0 }).unwrap();

    hub.subscribe(subject.key(), EndpointId(4));
    hub.subscribe(subject.key(), EndpointId(4));
    assert_eq!(
        transport.take_for(4),
        vec![update("ICounter-main", 0), update("ICounter-main", 0)]
    );

    hub.unsubscribe(subject.key(), EndpointId(4));
    subject.next(&Counter { value: 1 }).unwrap();
    assert_eq!(transport.take_for(4), vec![update("ICounter-main", 1)]);

    hub.unsubscribe(subject.key(), EndpointId(4));
    hub.unsubscribe(subject.key(), EndpointId(4));
    subject.next(&Counter { value: 2 }).unwrap();
    assert!(transport.take().is_empty());
    assert!(hub.active_subscribers(subject.key()).is_empty());
}

#[test]
fn test_unsubscribed_endpoint_is_skipped() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 0 }).unwrap();
    hub.subscribe(subject.key(), EndpointId(2));
    hub.subscribe(subject.key(), EndpointId(3));
    transport.take();

    transport.inject(2, Message::Unsubscribe(SubjectRef { key: subject.key().to_string() }));
    hub.unsubscribe(subject.key(), EndpointId(2));
    subject.next(&Counter { value: 9 }).unwrap();

    assert!(transport.take_for(2).is_empty());
    assert_eq!(transport.take_for(3), vec![update("ICounter-main", 9)]);
}

#[test]
fn test_unsubscribe_while_pending_prevents_initial_push() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());

    hub.subscribe("ICounter-main", EndpointId(2));
    hub.unsubscribe("ICounter-main", EndpointId(2));
    let _subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 1 }).unwrap();

    assert!(transport.take().is_empty());
}

#[test]
fn test_complete_is_terminal() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 3 }).unwrap();
    hub.subscribe(subject.key(), EndpointId(2));
    transport.take();

    subject.complete();
    assert_eq!(
        transport.take_for(2),
        vec![Message::Complete(Complete { key: "ICounter-main".to_string() })]
    );
    assert!(subject.is_completed());
    assert!(hub.active_subscribers(subject.key()).is_empty());

    subject.next(&Counter { value: 4 }).unwrap();
    subject.complete();
    assert!(transport.take().is_empty());
    assert_eq!(subject.value().unwrap(), Some(Counter { value: 3 }));
}

#[test]
fn test_late_subscriber_to_completed_subject_gets_final_value_and_is_not_kept() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 3 }).unwrap();
    subject.complete();

    hub.subscribe(subject.key(), EndpointId(6));

    assert_eq!(
        transport.take_for(6),
        vec![
            update("ICounter-main", 3),
            Message::Complete(Complete { key: "ICounter-main".to_string() }),
        ]
    );
    assert!(hub.active_subscribers(subject.key()).is_empty());
}

#[test]
fn test_closed_endpoint_is_purged_everywhere() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 0 }).unwrap();
    hub.subscribe(subject.key(), EndpointId(5));
    hub.subscribe("ICounter-other", EndpointId(5));
    transport.take();

    transport.close_peer(5);

    assert!(hub.active_subscribers(subject.key()).is_empty());
    assert!(hub.pending_subscribers("ICounter-other").is_empty());
    subject.next(&Counter { value: 1 }).unwrap();
    assert!(transport.take().is_empty());
}

#[test]
fn test_duplicate_subject_is_rejected() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport);
    let _subject = hub.create_subject(&ICOUNTER, "main", &Counter { value: 0 }).unwrap();

    let err = hub.create_subject(&ICOUNTER, "main", &Counter { value: 1 }).unwrap_err();
    assert!(matches!(err, hub::Error::SubjectExists(ref key) if key == "ICounter-main"));
}

#[test]
fn test_removed_subject_handle_cannot_touch_its_successor() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    let old = hub.create_subject(&ICOUNTER, "main", &Counter { value: 0 }).unwrap();
    hub.subscribe(old.key(), EndpointId(2));

    assert!(hub.remove_subject(old.key()));
    assert!(hub.active_subscribers("ICounter-main").is_empty());
    assert_eq!(old.value().unwrap(), None);

    let new = hub.create_subject(&ICOUNTER, "main", &Counter { value: 10 }).unwrap();
    hub.subscribe(new.key(), EndpointId(2));
    transport.take();

    old.next(&Counter { value: 99 }).unwrap();
    old.complete();
    assert!(transport.take().is_empty());
    assert_eq!(new.value().unwrap(), Some(Counter { value: 10 }));
    assert!(!new.is_completed());
}

#[test]
fn test_disposed_hub_ignores_subscribe_frames() {
    let transport = Arc::new(RecordingTransport::new(1));
    let hub = SubjectManager::new(transport.clone());
    hub.dispose();
    hub.dispose();

    transport.inject(2, Message::Subscribe(SubjectRef { key: "ICounter-main".to_string() }));
    assert!(hub.pending_subscribers("ICounter-main").is_empty());
    assert!(hub.is_disposed());
}

// --- service table ---

#[tokio::test]
async fn test_table_reports_unknown_service_and_method_by_name() {
    let table = ServiceTable::new();
    table.insert(&IMATH, Arc::new(math()));

    let err = table
        .dispatch(&request("1", "IOther", "add", vec![]), EndpointId(9))
        .await
        .unwrap_err();
    assert_eq!(err.message, "Unknown service: IOther");
    assert_eq!(err.fault_kind(), Some(FaultKind::UnknownService));

    let err = table
        .dispatch(&request("2", "IMath", "missing", vec![]), EndpointId(9))
        .await
        .unwrap_err();
    assert_eq!(err.message, "Unknown method: missing");
    assert_eq!(err.fault_kind(), Some(FaultKind::UnknownMethod));
}

#[tokio::test]
async fn test_table_keeps_fault_identity_and_catches_panics() {
    let table = ServiceTable::new();
    table.insert(&IMATH, Arc::new(math()));

    let sum = table
        .dispatch(&request("1", "IMath", "add", vec![json!(2), json!(3)]), EndpointId(9))
        .await
        .unwrap();
    assert_eq!(sum, json!(5));

    let err = table
        .dispatch(&request("2", "IMath", "fail", vec![]), EndpointId(9))
        .await
        .unwrap_err();
    assert_eq!(err.name, "RangeError");
    assert_eq!(err.message, "out of range");

    let err = table
        .dispatch(&request("3", "IMath", "explode", vec![]), EndpointId(9))
        .await
        .unwrap_err();
    assert_eq!(err.fault_kind(), Some(FaultKind::HandlerFailure));
    assert!(err.message.contains("kaboom"));
}

#[tokio::test]
async fn test_table_rejects_undecodable_arguments() {
    let table = ServiceTable::new();
    table.insert(&IMATH, Arc::new(math()));

    let err = table
        .dispatch(&request("1", "IMath", "add", vec![json!("two")]), EndpointId(9))
        .await
        .unwrap_err();
    assert_eq!(err.name, "InvalidArguments");
}

#[test]
fn test_table_respects_registration_role() {
    let table = ServiceTable::new();
    table.insert(&IMATH, Arc::new(math()));
    table.insert(&Identifier::unrouted("IAny"), Arc::new(math()));

    assert!(table.serves("IMath", Role::Background));
    assert!(!table.serves("IMath", Role::Content));
    assert!(table.serves("IAny", Role::Content));
    assert!(!table.serves("IOther", Role::Background));
}

// --- host ---

#[tokio::test]
async fn test_host_answers_the_origin_endpoint() {
    let transport = Arc::new(RecordingTransport::new(1));
    let host = Host::new(transport.clone(), Role::Background);
    host.register(&IMATH, math());

    transport.inject(5, Message::Call(request("c1", "IMath", "add", vec![json!(2), json!(3)])));

    let sent = wait_for(&transport, 5).await;
    let [Message::CallResponse(response)] = sent.as_slice() else {
        panic!("expected one response, got {:?}", sent);
    };
    assert_eq!(response.id, "c1");
    assert_eq!(response.result, Some(json!(5)));
    assert_eq!(response.from, Role::Background);
}

#[tokio::test]
async fn test_host_ignores_calls_for_other_roles_but_answers_its_pings() {
    let transport = Arc::new(RecordingTransport::new(1));
    let host = Host::new(transport.clone(), Role::Background);
    host.register(&IMATH, math());

    let mut call = request("c1", "IMath", "add", vec![json!(1), json!(1)]);
    call.to = Role::Content;
    transport.inject(5, Message::Call(call));
    transport.inject(
        5,
        Message::Ping(Ping { id: "p1".to_string(), service: "IMath".to_string(), to: Role::Content, from: Role::Content }),
    );
    transport.inject(
        5,
        Message::Ping(Ping { id: "p2".to_string(), service: "IMath".to_string(), to: Role::Background, from: Role::Content }),
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let sent = transport.take_for(5);
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Message::Pong(pong) if pong.id == "p2"));
}

#[tokio::test]
async fn test_disposed_host_stops_answering() {
    let transport = Arc::new(RecordingTransport::new(1));
    let host = Host::new(transport.clone(), Role::Background);
    host.register(&IMATH, math());
    host.dispose();

    transport.inject(5, Message::Call(request("c1", "IMath", "add", vec![json!(2), json!(3)])));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.take().is_empty());
}

// --- client ---

fn sent_call(sent: &[(Address, Message)]) -> Request {
    match sent {
        [(_, Message::Call(request))] => request.clone(),
        other => panic!("expected one call, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_settles_only_the_matching_response() {
    let transport = Arc::new(RecordingTransport::new(2));
    let client = Client::new(transport.clone(), ClientConfig::new(Role::Content));

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("IMath", "add", Role::Background, vec![json!(2), json!(3)]).await });

    let request = sent_call(&wait_any(&transport).await);
    assert_eq!(request.args, vec![json!(2), json!(3)]);
    assert_eq!(request.from, Role::Content);
    assert_eq!(client.pending(), 1);

    let mut stray = request.clone();
    stray.id = "someone-else".to_string();
    transport.inject(1, Message::CallResponse(Response::ok(&stray, Role::Background, json!(0))));
    transport.inject(1, Message::CallResponse(Response::ok(&request, Role::Background, json!(5))));
    transport.inject(1, Message::CallResponse(Response::ok(&request, Role::Background, json!(6))));

    assert_eq!(call.await.unwrap().unwrap(), json!(5));
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_client_rebuilds_remote_errors() {
    let transport = Arc::new(RecordingTransport::new(2));
    let client = Client::new(transport.clone(), ClientConfig::new(Role::Content));

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.call("IMath", "fail", Role::Background, vec![]).await });

    let request = sent_call(&wait_any(&transport).await);
    let payload = ErrorPayload::new("TypeError", "boom").with_stack("at fail");
    transport.inject(1, Message::CallResponse(Response::err(&request, Role::Background, payload)));

    let Err(client::Error::Remote(remote)) = call.await.unwrap() else {
        panic!("expected a remote error");
    };
    assert_eq!(remote.name, "TypeError");
    assert_eq!(remote.message, "boom");
    assert_eq!(remote.stack.as_deref(), Some("at fail"));
}

#[tokio::test]
async fn test_client_uses_configured_route() {
    let transport = Arc::new(RecordingTransport::new(2));
    let config = ClientConfig::new(Role::Content)
        .with_route(Role::Background, Address::Endpoint(EndpointId(1)))
        .with_call_timeout(Some(Duration::from_millis(10)));
    let client = Client::new(transport.clone(), config);

    let err = client.call("IMath", "add", Role::Background, vec![]).await.unwrap_err();
    assert!(matches!(err, client::Error::Timeout { .. }));
    assert_eq!(client.pending(), 0);

    let sent = transport.take();
    assert!(matches!(sent.as_slice(), [(Address::Endpoint(EndpointId(1)), Message::Call(_))]));
}

#[tokio::test]
async fn test_readiness_timeout_sends_no_call() {
    let transport = Arc::new(RecordingTransport::new(2));
    let config = ClientConfig::new(Role::Content).with_readiness(Duration::from_millis(5), Duration::from_millis(40));
    let client = Client::new(transport.clone(), config);

    let err = client.create_service(&IMATH).await.unwrap_err();
    assert_eq!(err.fault_kind(), Some(FaultKind::ReadinessTimeout));

    let sent = transport.take();
    assert!(sent.len() >= 2, "pings should be re-sent, got {}", sent.len());
    assert!(sent.iter().all(|(_, message)| matches!(message, Message::Ping(_))));
}

#[tokio::test]
async fn test_disposed_client_refuses_calls() {
    let transport = Arc::new(RecordingTransport::new(2));
    let client = Client::new(transport.clone(), ClientConfig::new(Role::Content));
    client.dispose();

    let err = client.call("IMath", "add", Role::Background, vec![]).await.unwrap_err();
    assert!(matches!(err, client::Error::Disposed));
    assert!(transport.take().is_empty());
}

// --- router ---

#[tokio::test]
async fn test_hub_relays_and_rewrites_the_response() {
    let transport = Arc::new(RecordingTransport::new(1));
    let config = RouterConfig::hub(Role::Background).with_client(
        ClientConfig::new(Role::Background).with_route(Role::Content, Address::Endpoint(EndpointId(3))),
    );
    let router = Router::new(transport.clone(), config).unwrap();

    let mut call = request("orig", "IPage", "title", vec![]);
    call.to = Role::Content;
    transport.inject(2, Message::Call(call));

    let relayed = match transport.take_for(3).as_slice() {
        [Message::Call(relayed)] => relayed.clone(),
        other => panic!("expected relayed call, got {:?}", other),
    };
    assert_ne!(relayed.id, "orig");
    assert_eq!(relayed.service, "IPage");
    assert_eq!(router.relays(), 1);

    transport.inject(3, Message::CallResponse(Response::ok(&relayed, Role::Content, json!("home"))));

    let back = transport.take_for(2);
    let [Message::CallResponse(response)] = back.as_slice() else {
        panic!("expected relayed response, got {:?}", back);
    };
    assert_eq!(response.id, "orig");
    assert_eq!(response.result, Some(json!("home")));
    assert_eq!(router.relays(), 0);
}

#[tokio::test]
async fn test_hub_does_not_rebroadcast_calls() {
    let transport = Arc::new(RecordingTransport::new(1));
    let router = Router::new(transport.clone(), RouterConfig::hub(Role::Background)).unwrap();

    let mut elsewhere = request("c1", "IPage", "title", vec![]);
    elsewhere.to = Role::Content;
    transport.inject_broadcast(2, Message::Call(elsewhere));
    transport.inject_broadcast(2, Message::Call(request("c2", "IMath", "add", vec![])));

    assert!(transport.take().is_empty());
    assert_eq!(router.relays(), 0);
}

#[tokio::test]
async fn test_hub_reports_unknown_service_only_for_directed_calls() {
    let transport = Arc::new(RecordingTransport::new(1));
    let _router = Router::new(transport.clone(), RouterConfig::hub(Role::Background)).unwrap();

    transport.inject(2, Message::Call(request("c1", "IMath", "add", vec![])));

    let sent = transport.take_for(2);
    let [Message::CallResponse(response)] = sent.as_slice() else {
        panic!("expected one response, got {:?}", sent);
    };
    assert_eq!(response.id, "c1");
    assert_eq!(response.error.as_ref().and_then(|e| e.fault_kind()), Some(FaultKind::UnknownService));
}

#[tokio::test]
async fn test_router_pongs_without_consulting_services() {
    let transport = Arc::new(RecordingTransport::new(1));
    let _router = Router::new(transport.clone(), RouterConfig::hub(Role::Background)).unwrap();

    transport.inject(
        4,
        Message::Ping(Ping { id: "p".to_string(), service: "INothing".to_string(), to: Role::Content, from: Role::Content }),
    );

    assert!(matches!(transport.take_for(4).as_slice(), [Message::Pong(pong)] if pong.id == "p"));
}
