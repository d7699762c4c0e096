//! HarvesterApi over the Harvester (Steve) REST API
//!
//! Resources live under `/v1/<type>/<namespace>/<name>` where `<type>` is the
//! group-qualified plural. Power actions are `POST ...?action=<verb>`. The
//! session is a cookie obtained from the login endpoint matching the
//! server's auth mode.

use async_trait::async_trait;
use harvester_common::crd::{
    KeyPair, NetworkAttachmentDefinition, Setting, VirtualMachine, VirtualMachineImage,
    VirtualMachineInstance,
};
use harvester_common::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{HarvesterApi, VmAction};
use crate::config::ConnectionConfig;

const VM_TYPE: &str = "kubevirt.io.virtualmachines";
const VMI_TYPE: &str = "kubevirt.io.virtualmachineinstances";
const IMAGE_TYPE: &str = "harvesterhci.io.virtualmachineimages";
const KEY_PAIR_TYPE: &str = "harvesterhci.io.keypairs";
const SETTING_TYPE: &str = "harvesterhci.io.settings";
const NETWORK_TYPE: &str = "k8s.cni.cncf.io.network-attachment-definitions";
const STORAGE_CLASS_TYPE: &str = "storage.k8s.io.storageclasses";
const SECRET_TYPE: &str = "secrets";

const AUTH_MODE_RANCHER: &str = "rancher";
const AUTH_MODE_LOCAL_USER: &str = "localUser";
const SESSION_TTL_MILLIS: u64 = 57_600_000;

const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

#[derive(Debug, Default, Deserialize)]
struct AuthModes {
    #[serde(default)]
    modes: Vec<String>,
}

/// Login endpoint and payload for the advertised auth modes
fn login_request(
    base: &str,
    modes: &[String],
    username: &str,
    password: &str,
) -> Result<(String, Value)> {
    if modes.len() == 1 && modes[0] == AUTH_MODE_RANCHER {
        return Ok((
            format!("{base}/v3-public/localProviders/local?action=login"),
            json!({
                "username": username,
                "password": password,
                "ttl": SESSION_TTL_MILLIS,
                "description": "UI Session",
                "responseType": "cookie",
            }),
        ));
    }
    if modes.iter().any(|m| m == AUTH_MODE_LOCAL_USER) {
        return Ok((
            format!("{base}/v1-public/auth?action=login"),
            json!({"username": username, "password": password}),
        ));
    }
    Err(Error::validation(format!(
        "unsupported auth modes {modes:?}, expected localUser or rancher"
    )))
}

/// `/v1/<type>[/<namespace>][/<name>]`
fn resource_url(base: &str, kind: &str, namespace: Option<&str>, name: Option<&str>) -> String {
    let mut url = format!("{base}/v1/{kind}");
    for segment in [namespace, name].into_iter().flatten() {
        url.push('/');
        url.push_str(segment);
    }
    url
}

fn action_url(base: &str, namespace: &str, name: &str, action: VmAction) -> String {
    format!(
        "{}?action={action}",
        resource_url(base, VM_TYPE, Some(namespace), Some(name))
    )
}

/// Turn a non-success response into [`Error::Api`]
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

/// REST client holding a logged-in session
pub struct SteveHarvesterApi {
    http: reqwest::Client,
    base: String,
}

impl SteveHarvesterApi {
    /// Open a session against `connection.endpoint`
    pub async fn connect(connection: &ConnectionConfig) -> Result<Self> {
        let endpoint = connection.endpoint.as_deref().ok_or_else(|| {
            Error::validation_for_field("harvester-endpoint", "endpoint is required")
        })?;
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(connection.insecure_skip_verify)
            .build()?;
        let api = Self {
            http,
            base: endpoint.trim_end_matches('/').to_string(),
        };
        if let (Some(username), Some(password)) = (&connection.username, &connection.password) {
            api.login(username, password).await?;
        }
        Ok(api)
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let modes: AuthModes = check(
            self.http
                .get(format!("{}/v1-public/auth-modes", self.base))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        let (url, body) = login_request(&self.base, &modes.modes, username, password)?;
        check(self.http.post(url).json(&body).send().await?).await?;
        info!(endpoint = %self.base, "Logged in to Harvester");
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<T>> {
        let url = resource_url(&self.base, kind, namespace, Some(name));
        debug!(url = %url, "GET");
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    async fn create<T>(&self, kind: &str, obj: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Sync,
    {
        let url = resource_url(&self.base, kind, None, None);
        Ok(check(self.http.post(url).json(obj).send().await?)
            .await?
            .json()
            .await?)
    }
}

#[async_trait]
impl HarvesterApi for SteveHarvesterApi {
    async fn get_setting(&self, name: &str) -> Result<Option<Setting>> {
        self.get(SETTING_TYPE, None, name).await
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>> {
        self.get(VM_TYPE, Some(namespace), name).await
    }

    async fn get_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>> {
        self.get(VMI_TYPE, Some(namespace), name).await
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.create(VM_TYPE, vm).await
    }

    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let url = resource_url(&self.base, VM_TYPE, Some(namespace), Some(name));
        let request = self
            .http
            .patch(url)
            .header(CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
            .body(serde_json::to_vec(patch)?);
        check(request.send().await?).await?;
        Ok(())
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()> {
        let url = resource_url(&self.base, VM_TYPE, Some(namespace), Some(name));
        check(
            self.http
                .delete(format!("{url}?propagationPolicy=Foreground"))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn vm_action(&self, namespace: &str, name: &str, action: VmAction) -> Result<()> {
        let url = action_url(&self.base, namespace, name, action);
        check(self.http.post(url).send().await?).await?;
        Ok(())
    }

    async fn get_image(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineImage>> {
        self.get(IMAGE_TYPE, Some(namespace), name).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        self.get(STORAGE_CLASS_TYPE, None, name).await
    }

    async fn get_key_pair(&self, namespace: &str, name: &str) -> Result<Option<KeyPair>> {
        self.get(KEY_PAIR_TYPE, Some(namespace), name).await
    }

    async fn get_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>> {
        self.get(NETWORK_TYPE, Some(namespace), name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(SECRET_TYPE, secret).await
    }
}
