// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use futures_util::future::BoxFuture;

use super::{CallArgs, ClassifyArgs};
use crate::error::Fault;

crate::utils::define_fn_wrapper!(ProtectedOp<In, Out>(Fn(input: In) -> BoxFuture<'static, Out>));
crate::utils::define_fn_wrapper!(ClassifyFault<Out>(Fn(output: &Out, args: ClassifyArgs) -> Option<Fault>));
crate::utils::define_fn_wrapper!(OnCall<Out>(Fn(output: &Out, args: CallArgs)));
