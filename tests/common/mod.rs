//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use siteplan::interpreter::RequestBody;
use siteplan::runtime::{
    RuntimeConfig, Services, Site, SiteCatalog, Transport, TransportError, TransportResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use url::Url;

/// Transport answering from a fixed URL → body table
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.responses.lock().insert(url.to_string(), body.into());
    }

    pub fn respond_json(&self, url: &str, value: Value) {
        self.respond(url, serde_json::to_vec(&value).unwrap());
    }

    /// Hold requests for `url` until the returned gate is notified.
    pub fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(url.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|call| *call == url).count()
    }

    async fn answer(&self, url: &Url) -> TransportResult<Vec<u8>> {
        self.calls.lock().push(url.to_string());
        let gate = self.gates.lock().get(url.as_str()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| TransportError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &Url, _headers: &[(String, String)]) -> TransportResult<Vec<u8>> {
        self.answer(url).await
    }

    async fn post(
        &self,
        url: &Url,
        _headers: &[(String, String)],
        _body: &RequestBody,
    ) -> TransportResult<Vec<u8>> {
        self.answer(url).await
    }

    async fn head(&self, url: &Url) -> TransportResult<()> {
        self.answer(url).await.map(|_| ())
    }
}

pub const TUBE: &str = "https://www.tube.test/c/someone";

pub fn catalog() -> SiteCatalog {
    SiteCatalog::from_value(&serde_json::json!({
        "tube": {
            "name": "Tube",
            "vars": {"client": "abc"},
            "api_url": "https://api.tube.test/v1/",
            "compatibility": [{"match": "=", "v": ["DOMAIN", "www.tube.test"]}],
            "extract_channel_name": [
                {"get": "URL", "rx": "/c/([^/?]+)", "dest": "c"},
                {"return": "c"}
            ],
            "get_name": [{"set": "Tube TV", "dest": "n"}, {"return": "n"}],
            "get_channel": [
                {"action": "login", "dest": "auth"},
                {"api": "channels/${name}", "dest": "resp"},
                {"get": "resp.channel", "dest": "channel"},
                {"set": "${auth.token}", "dest": "channel.token"},
                {"return": "channel"}
            ],
            "login": [
                {"http": "https://www.tube.test/login", "dest": "page"},
                {"return": "page"}
            ],
            "get_channel_videos": [
                {"api": "videos?page=${PAGE_NUMBER}", "dest": "resp"},
                {"array": "resp.items", "dest": "item"},
                {"set": "https://www.tube.test/watch/${item.id}", "dest": "item.link"},
                {"return-array": "item"}
            ],
            "normalize_video_url": [
                {"get": "url", "rx": "(https://www\\.tube\\.test/watch/\\w+)", "dest": "u"},
                {"return": "u"}
            ],
            "get_video_url": [
                {"get": "url", "rx": "watch/(\\w+)", "dest": "id"},
                {"set": "https://cdn.tube.test/${id}.mp4", "dest": "src"},
                {"return": "src"}
            ]
        },
        "vault": {
            "compatibility": [{"api": "ping", "dest": "pong"}, {"return": "pong.ok"}],
            "get_name": [{"get": "nothing"}]
        }
    }))
    .unwrap()
}

pub fn services(transport: &Arc<ScriptedTransport>) -> Services {
    Services::new(transport.clone())
}

pub fn site(transport: &Arc<ScriptedTransport>, runtime: RuntimeConfig) -> Site {
    site_with(services(transport), runtime)
}

pub fn site_with(services: Services, runtime: RuntimeConfig) -> Site {
    let config = catalog().get("tube").unwrap();
    Site::new(config, Url::parse(TUBE).unwrap(), services, runtime)
}
