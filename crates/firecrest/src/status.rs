//! Implementation of the status and reservation queries.

use reqwest::Method;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::Category;
use crate::Client;
use crate::Result;
use crate::client::MACHINE_HEADER;
use crate::client::decode;

/// The status FirecREST reports for a system that accepts work.
pub const AVAILABLE: &str = "available";

/// Represents the status of a system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// The name of the system.
    pub system: String,
    /// The status of the system (e.g. `available`).
    pub status: String,
    /// The description of the status.
    #[serde(default)]
    pub description: Option<String>,
}

impl SystemStatus {
    /// Determines if the system is available.
    pub fn is_available(&self) -> bool {
        self.status.eq_ignore_ascii_case(AVAILABLE)
    }
}

/// Represents the response of the status endpoints.
#[derive(Debug, Deserialize)]
struct StatusResponse<T> {
    /// The payload.
    out: T,
}

/// Represents the response of the reservations endpoint.
#[derive(Debug, Deserialize)]
struct ReservationsResponse {
    /// The reservations.
    #[serde(default)]
    success: Vec<JsonValue>,
}

impl Client {
    /// Gets the status of every system.
    pub async fn systems(&self) -> Result<Vec<SystemStatus>> {
        const PATH: &str = "status/systems";

        let response = self
            .send(Category::Status, Method::GET, PATH, |r| r)
            .await?;
        let response: StatusResponse<Vec<SystemStatus>> =
            decode(PATH, response).await?.or_api(PATH)?;
        Ok(response.out)
    }

    /// Gets the status of a single system.
    pub async fn system(&self, name: &str) -> Result<SystemStatus> {
        let path = format!("status/systems/{name}");

        let response = self
            .send(Category::Status, Method::GET, &path, |r| r)
            .await?;
        let response: StatusResponse<SystemStatus> =
            decode(&path, response).await?.or_api(&path)?;
        Ok(response.out)
    }

    /// Gets the reservations on a system.
    ///
    /// Reservations are returned as reported by the scheduler.
    pub async fn reservations(&self, system: &str) -> Result<Vec<JsonValue>> {
        const PATH: &str = "reservations";

        let response = self
            .send(Category::Reservations, Method::GET, PATH, |r| {
                r.header(MACHINE_HEADER, system)
            })
            .await?;
        let response: ReservationsResponse = decode(PATH, response).await?.or_api(PATH)?;
        Ok(response.success)
    }
}
