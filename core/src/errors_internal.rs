// Copyright 2025 the Replete authors. All rights reserved. MIT license.
use std::borrow::Cow;

use hyper::Body;
use hyper::Response;
use routerify::RequestInfo;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::RepleteError;

#[derive(Serialize, Deserialize)]
pub struct RepleteErrorStruct {
  pub code: Cow<'static, str>,
  pub message: Cow<'static, str>,
}

/// This macro builds an error enum that can be rendered to a `Response`.
/// Every error variant has a "code" (e.g `packageNotFound`), "message" (a
/// human readable description of the error), and a "status code" (the HTTP
/// status code the source server answers with when the error surfaces during
/// a request).
///
/// The variant name (e.g `NotFound`) will be used as both the variant name,
/// and after being converted to `camelCase` will be used as the error code.
///
/// Error variants can contain fields, which can be used when formatting the
/// error message. The fields are declared in the macro using the
/// `fields: { ... }` syntax. The fields are then available in the error
/// message using the `({ <field>* }) => <format string>` syntax.
#[macro_export]
macro_rules! errors {
  ($($name:ident { status: $status:ident $(, fields: $fields:tt)? $(, $msg_lit:literal)? $(, ($pattern:tt) => $msg_expr:tt)? $(,)? }),*$(,)?) => {
    #[derive(Debug, Clone)]
    pub enum RepleteError {
      $($name $($fields)?),*
    }

    impl RepleteError {
      pub fn status_code(&self) -> hyper::StatusCode {
        match self {
          $(Self::$name { .. } => hyper::StatusCode::$status),*
        }
      }

      pub fn code(&self) -> &'static str {
        match self {
          $(Self::$name { .. } => const_format::map_ascii_case!(const_format::Case::Camel, stringify!($name))),*
        }
      }

      pub fn message(&self) -> std::borrow::Cow<'static, str> {
        match self {
          $(Self::$name $({..} => std::borrow::Cow::Borrowed($msg_lit))? $($pattern => std::borrow::Cow::Owned(format!($msg_expr)))?),*
        }
      }
    }

    impl RepleteError {
      pub fn json(&self) -> String {
        let err = $crate::errors_internal::RepleteErrorStruct {
          code: Cow::Borrowed(self.code()),
          message: self.message(),
        };
        serde_json::to_string_pretty(&err).unwrap()
      }

      pub fn json_response(&self) -> hyper::Response<hyper::Body> {
        hyper::Response::builder()
          .status(self.status_code())
          .header("Content-Type", "application/json")
          .body(hyper::Body::from(self.json()))
          .unwrap()
      }
    }

    impl std::fmt::Display for RepleteError {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
      }
    }

    impl std::error::Error for RepleteError {}
  };
}

pub async fn error_handler(
  err: routerify::RouteError,
  _: RequestInfo,
) -> Response<Body> {
  // Because `routerify::RouteError` is a boxed error, it must be downcast
  // first. Unwrap for simplicity.
  let replete_err = err.downcast::<RepleteError>().unwrap();
  tracing::error!({ code = replete_err.code() }, "{}", replete_err.message());
  replete_err.json_response()
}
