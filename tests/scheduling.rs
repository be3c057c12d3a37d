//! Integration tests for admission, timeouts and sub-action delegation

mod common;

use common::{ScriptedTransport, services, site, site_with};
use serde_json::{Map, json};
use siteplan::runtime::{ActionError, ContextStatus, RuntimeConfig, SiteRole};
use std::time::Duration;

const LISTING: &str = "https://api.tube.test/v1/videos?page=1";
const LOGIN: &str = "https://www.tube.test/login";

#[tokio::test(start_paused = true)]
async fn when_ready_waits_for_idle_site() {
    let transport = ScriptedTransport::new();
    transport.respond_json(LISTING, json!({"items": [{"id": "a"}]}));
    let gate = transport.gate(LISTING);
    let site = site(&transport, RuntimeConfig::default());

    let listing = site.load_channel_videos(None).unwrap();
    let name = site.call_when_ready("get_name", Map::new()).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(listing.status(), ContextStatus::Suspended);
    assert_eq!(name.status(), ContextStatus::Created);
    assert!(site.is_busy());

    gate.notify_one();
    listing.outcome().await.unwrap();
    assert_eq!(name.outcome().await.unwrap(), json!("Tube TV"));
    assert!(!site.is_busy());
}

#[tokio::test(start_paused = true)]
async fn plain_calls_ignore_busy_sites() {
    let transport = ScriptedTransport::new();
    let _gate = transport.gate(LISTING);
    let site = site(&transport, RuntimeConfig::default());

    let listing = site.load_channel_videos(None).unwrap();
    tokio::task::yield_now().await;
    let name = site.load_site_name().unwrap();
    assert_eq!(name.outcome().await.unwrap(), json!("Tube TV"));
    assert_eq!(listing.status(), ContextStatus::Suspended);
}

#[tokio::test(start_paused = true)]
async fn timeout_abandons_and_unblocks() {
    let transport = ScriptedTransport::new();
    transport.respond_json(LISTING, json!({"items": []}));
    let gate = transport.gate(LISTING);
    let runtime = RuntimeConfig {
        context_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let site = site(&transport, runtime);

    let stuck = site.load_channel_videos(None).unwrap();
    let name = site.call_when_ready("get_name", Map::new()).unwrap();

    assert!(matches!(stuck.outcome().await, Err(ActionError::TimedOut(_))));
    assert_eq!(stuck.status(), ContextStatus::Abandoned);
    assert_eq!(site.pending_count(), 0);
    assert_eq!(name.outcome().await.unwrap(), json!("Tube TV"));

    // the late reply finds nothing to resume
    gate.notify_one();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(stuck.status(), ContextStatus::Abandoned);
    assert_eq!(site.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn manual_sweep_leaves_fresh_contexts() {
    let transport = ScriptedTransport::new();
    let _gate = transport.gate(LISTING);
    let site = site(&transport, RuntimeConfig::default());

    let listing = site.load_channel_videos(None).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(site.sweep_timeouts(), 0);
    assert_eq!(site.active_count(), 1);
    assert_eq!(listing.status(), ContextStatus::Suspended);
}

#[tokio::test(start_paused = true)]
async fn sub_actions_run_once_per_domain() {
    let transport = ScriptedTransport::new();
    transport.respond_json(LOGIN, json!({"token": "t"}));
    transport.respond_json(
        "https://api.tube.test/v1/channels/someone",
        json!({"channel": {"name": "Someone", "id": 7}}),
    );
    let gate = transport.gate(LOGIN);

    let shared = services(&transport);
    let first = site_with(shared.clone(), RuntimeConfig::default());
    let second = site_with(shared.clone(), RuntimeConfig::default());

    let a = first.load_channel("someone").unwrap();
    let b = second.load_channel("someone").unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls(LOGIN), 1);
    gate.notify_one();

    let expected = json!({"name": "Someone", "id": 7, "token": "t"});
    assert_eq!(a.outcome().await.unwrap(), expected);
    assert_eq!(b.outcome().await.unwrap(), expected);
    assert_eq!(transport.calls(LOGIN), 1);

    let control = first.control().unwrap();
    assert!(control.ptr_eq(&second.control().unwrap()));
    assert_eq!(control.role(), SiteRole::Control);
    assert_eq!(shared.registry.live_count(), 1);

    // the channel result updates each view
    assert_eq!(first.channel(), "Someone");
    assert_eq!(second.var("CHANNEL"), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn control_registry_releases_unused_instances() {
    let transport = ScriptedTransport::new();
    transport.respond_json(LOGIN, json!({"token": "t"}));
    let shared = services(&transport);

    {
        let view = site_with(shared.clone(), RuntimeConfig::default());
        let control = view.control_instance();
        assert_eq!(shared.registry.live_count(), 1);
        assert_eq!(control.domain(), "www.tube.test");
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(shared.registry.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_sub_action_fails_parent() {
    let transport = ScriptedTransport::new();
    let site = site(&transport, RuntimeConfig::default());

    let ctx = site.load_channel("someone").unwrap();
    let Err(ActionError::Failed(report)) = ctx.outcome().await else {
        panic!("expected the parent to fail");
    };
    assert_eq!(report.step_index, 0);
    assert!(report.reason.to_string().contains("login"));
}
