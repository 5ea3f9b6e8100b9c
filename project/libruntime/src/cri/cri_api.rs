//! Wire types and clients for the `runtime.v1` CRI services, generated by
//! tonic-build from `proto/api.proto`.

#![allow(clippy::derive_partial_eq_without_eq)]

tonic::include_proto!("runtime.v1");
