//! Named JSON operations that can be declared in a configuration file.

use crate::pipeline::filters::unique_field;
use crate::pipeline::function::{Emitter, FnStage, Outcome};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stage operation over JSON values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BuiltinOp {
    /// Forward every value unchanged.
    Passthrough,
    /// Keep the first object for each value of `key`.
    Unique { key: String },
    /// Replace an object by the value of one of its fields.
    Select { field: String },
    /// Emit each element of an array separately; other values pass through.
    Flatten,
}

impl BuiltinOp {
    pub fn name(&self) -> String {
        match self {
            BuiltinOp::Passthrough => "passthrough".to_string(),
            BuiltinOp::Unique { key } => format!("unique({key})"),
            BuiltinOp::Select { field } => format!("select({field})"),
            BuiltinOp::Flatten => "flatten".to_string(),
        }
    }

    pub fn build(&self) -> FnStage<Value> {
        match self {
            BuiltinOp::Passthrough => FnStage::map(self.name(), |item| Ok(Outcome::Emit(item))),
            BuiltinOp::Unique { key } => unique_field(key.clone()),
            BuiltinOp::Select { field } => {
                let field = field.clone();
                FnStage::map(self.name(), move |mut item: Value| {
                    item.get_mut(&field)
                        .map(|value| Outcome::Emit(value.take()))
                        .ok_or_else(|| anyhow!("item has no field `{field}`"))
                })
            }
            BuiltinOp::Flatten => FnStage::with_emit(self.name(), |item: Value, emit: Emitter<Value>| async move {
                match item {
                    Value::Array(values) => {
                        for value in values {
                            emit.emit(value).await?;
                        }
                        Ok::<_, anyhow::Error>(Outcome::Skip)
                    }
                    other => Ok(Outcome::Emit(other)),
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Input, QueueIo};
    use crate::pipeline::IntoStage;
    use serde_json::json;
    use std::sync::Arc;

    async fn apply(op: BuiltinOp, items: Vec<Value>) -> (Vec<Value>, usize) {
        let output = Arc::new(QueueIo::unbounded());
        let stage = op
            .build()
            .into_stage()
            .with_input(items)
            .with_output(Arc::clone(&output));
        stage.start().await.unwrap();

        let mut received = Vec::new();
        while let Some(item) = output.read().await.unwrap() {
            received.push(item);
        }
        (received, stage.status().error_count())
    }

    #[test]
    fn test_parse_from_yaml() {
        let ops: Vec<BuiltinOp> = serde_yaml::from_str(
            "- op: passthrough\n- op: unique\n  key: id\n- op: select\n  field: body\n- op: flatten\n",
        )
        .unwrap();
        assert_eq!(
            ops,
            vec![
                BuiltinOp::Passthrough,
                BuiltinOp::Unique { key: "id".to_string() },
                BuiltinOp::Select { field: "body".to_string() },
                BuiltinOp::Flatten,
            ]
        );
    }

    #[tokio::test]
    async fn test_select_field() {
        let (received, errors) = apply(
            BuiltinOp::Select { field: "n".to_string() },
            vec![json!({"n": 1}), json!({"m": 2}), json!({"n": [3]})],
        )
        .await;
        assert_eq!(received, vec![json!(1), json!([3])]);
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_flatten_arrays() {
        let (received, errors) = apply(BuiltinOp::Flatten, vec![json!([1, 2]), json!("x"), json!([]), json!([3])]).await;
        assert_eq!(received, vec![json!(1), json!(2), json!("x"), json!(3)]);
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_names() {
        assert_eq!(BuiltinOp::Unique { key: "id".to_string() }.name(), "unique(id)");
        assert_eq!(BuiltinOp::Flatten.name(), "flatten");
    }
}
