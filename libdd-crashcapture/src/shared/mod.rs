// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the report writer and the
//! report parser.

pub(crate) mod configuration;
pub mod constants;
pub(crate) mod metadata;
