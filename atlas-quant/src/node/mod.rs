//! Graph nodes.

use crate::ops::Operator;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One operator application in a [`QuantizedModule`](crate::model::QuantizedModule) graph.
pub struct ComputationNode {
    /// Name of the tensor this node produces.
    pub output: String,
    /// Names of the consumed tensors, in operator argument order.
    pub inputs: Vec<String>,
    /// Instance tag of the operator, e.g. `gemm_1`. Backends may derive dot-separated
    /// sub-tags from it (`gemm_1.matmul`).
    pub tag: String,
    pub operator: Operator,
}

impl ComputationNode {
    pub fn new<S: Into<String>>(
        output: impl Into<String>,
        inputs: impl IntoIterator<Item = S>,
        tag: impl Into<String>,
        operator: Operator,
    ) -> Self {
        ComputationNode {
            output: output.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            tag: tag.into(),
            operator,
        }
    }
}
