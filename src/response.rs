//! Standard response envelope helpers.

use crate::service::{Listing, Row};
use axum::{http::StatusCode, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
}

#[derive(Serialize)]
pub struct SuccessMany<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

#[derive(Serialize)]
pub struct PageMeta {
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

pub fn success_one<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::OK, Json(SuccessOne { data }))
}

pub fn success_created<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::CREATED, Json(SuccessOne { data }))
}

/// Page of rows with the filter-wide total.
pub fn success_page(listing: Listing) -> (StatusCode, Json<SuccessMany<Row>>) {
    (
        StatusCode::OK,
        Json(SuccessMany {
            data: listing.items,
            meta: PageMeta {
                total: listing.total,
                page: listing.page,
                size: listing.size,
            },
        }),
    )
}
