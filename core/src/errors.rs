// Copyright 2025 the Replete authors. All rights reserved. MIT license.
use std::borrow::Cow;

crate::errors!(
  PackageNotFound {
    status: NOT_FOUND,
    fields: { specifier: String, parent: String },
    ({ specifier, parent }) => "Package not found: \"{specifier}\" imported from {parent}.",
  },
  NotExported {
    status: NOT_FOUND,
    fields: { specifier: String, parent: String },
    ({ specifier, parent }) => "Not exported: \"{specifier}\" imported from {parent}.",
  },
  NotFound {
    status: NOT_FOUND,
    "The requested resource was not found.",
  },
  Forbidden {
    status: FORBIDDEN,
    fields: { locator: String },
    ({ locator }) => "Read forbidden outside the root locator: {locator}.",
  },
  ReadFailed {
    status: NOT_FOUND,
    fields: { locator: String, message: String },
    ({ locator, message }) => "Failed to read {locator}: {message}.",
  },
  ParseFailed {
    status: BAD_REQUEST,
    fields: { locator: String, message: String },
    ({ locator, message }) => "Failed to parse {locator}: {message}.",
  },
  UnknownMediaType {
    status: NOT_FOUND,
    fields: { locator: String },
    ({ locator }) => "Unknown media type: {locator}.",
  },
  TransportDied {
    status: INTERNAL_SERVER_ERROR,
    "CMDL died.",
  },
  MalformedRequest {
    status: BAD_REQUEST,
    fields: { msg: Cow<'static, str> },
    ({ msg }) => "Malformed request: {msg}.",
  },
  InternalServerError {
    status: INTERNAL_SERVER_ERROR,
    "Internal Server Error",
  },
);

impl From<anyhow::Error> for RepleteError {
  fn from(error: anyhow::Error) -> RepleteError {
    tracing::error!("internal error: {:?}", error);
    RepleteError::InternalServerError
  }
}

impl From<std::io::Error> for RepleteError {
  fn from(error: std::io::Error) -> RepleteError {
    anyhow::Error::from(error).into()
  }
}

impl From<serde_json::Error> for RepleteError {
  fn from(error: serde_json::Error) -> RepleteError {
    anyhow::Error::from(error).into()
  }
}

impl From<hyper::Error> for RepleteError {
  fn from(error: hyper::Error) -> RepleteError {
    anyhow::Error::from(error).into()
  }
}
