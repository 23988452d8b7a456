//! Application gateway that turns end-user enroll and login requests into
//! PUT and GET operations against the replicas.
//!
//! The PAKE exchange is external: `pake_message` is accepted and ignored,
//! and `pake_response` is always empty. The recovered secret travels back in
//! `encrypted_blob`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::client::{Client, UserRequest};
use crate::message::{EnrollRequest, EnrollResponse, LoginRequest, LoginResponse, Message};

pub struct Gateway {
    client: Arc<Client>,
    requests: tokio::sync::mpsc::UnboundedReceiver<UserRequest>,
    op_timeout: Duration,
}

impl Gateway {
    pub fn new(mut client: Client, op_timeout: Duration) -> Result<Self> {
        let requests = client
            .take_user_requests()
            .ok_or_else(|| anyhow!("user requests of client {} are already taken", client.id()))?;
        Ok(Self {
            client: Arc::new(client),
            requests,
            op_timeout,
        })
    }

    /// Serves requests until the client stops; each request runs in its own task.
    pub async fn run(mut self) -> Result<()> {
        info!(id = self.client.id(), "gateway serving");
        while let Some(request) = self.requests.recv().await {
            let client = Arc::clone(&self.client);
            let op_timeout = self.op_timeout;
            tokio::spawn(async move {
                let outcome = match request {
                    UserRequest::Enroll(request) => enroll(&client, request, op_timeout).await,
                    UserRequest::Login(request) => login(&client, request, op_timeout).await,
                };
                if let Err(err) = outcome {
                    warn!(error = %err, "user request failed");
                }
            });
        }
        Ok(())
    }
}

async fn enroll(client: &Client, request: EnrollRequest, op_timeout: Duration) -> Result<()> {
    client
        .put(&request.username, request.password.into_bytes(), op_timeout)
        .await?;
    let response = EnrollResponse::signed(&request.username, request.timestamp, client.signer());
    info!(user = request.user_id, username = %request.username, "enrolled");
    client.send(request.user_id, &Message::EnrollResponse(response))
}

async fn login(client: &Client, request: LoginRequest, op_timeout: Duration) -> Result<()> {
    let secret = client.get(&request.username, op_timeout).await?;
    let response = LoginResponse::signed(
        &request.username,
        Vec::new(),
        secret,
        request.timestamp,
        client.signer(),
    );
    info!(user = request.user_id, username = %request.username, "logged in");
    client.send(request.user_id, &Message::LoginResponse(response))
}
