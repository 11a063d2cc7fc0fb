//! HTTP handlers for the statistics endpoints.
//!
//! The optional `date` query parameter (ISO `YYYY-MM-DD`) selects the
//! matching per-day aggregator; omitting it selects today.

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;

use super::aggregator::StatsRegistry;
use super::types::{HourlyReport, ServerStatistics, Statistics};
use crate::error::ApiError;
use crate::runtime::ids::ServerId;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub date: Option<String>,
}

fn select_day(
    stats: &StatsRegistry,
    date: Option<String>,
) -> Result<Arc<super::StatsAggregator>, ApiError> {
    match date {
        None => Ok(stats.today()),
        Some(date) => {
            NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
                ApiError::Validation(format!("invalid date '{}', expected YYYY-MM-DD", date))
            })?;
            Ok(stats.for_day(&date))
        }
    }
}

pub async fn get_stats(
    Extension(stats): Extension<Arc<StatsRegistry>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Statistics>, ApiError> {
    let aggregator = select_day(&stats, query.date)?;
    Ok(Json(aggregator.get_stats().await))
}

pub async fn get_hourly(
    Extension(stats): Extension<Arc<StatsRegistry>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<HourlyReport>>, ApiError> {
    let aggregator = select_day(&stats, query.date)?;
    Ok(Json(aggregator.get_hourly_report().await))
}

pub async fn get_server_stats(
    Extension(stats): Extension<Arc<StatsRegistry>>,
    Path(server_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ServerStatistics>, ApiError> {
    let aggregator = select_day(&stats, query.date)?;
    Ok(Json(
        aggregator.get_server_stats(&ServerId(server_id)).await,
    ))
}
