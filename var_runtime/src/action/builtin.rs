use super::{ActionContext, ActionDef};
use crate::{error::Result, notification::Notification, runtime::Runtime};
use serde::Deserialize;
use serde_json::Value;
use var_graph::variable::AnyVariable;

/// Replaced by the value the action was triggered with.
pub const INPUT: &str = "__INPUT__";
/// Replaced by the negation of the variable's current value.
pub const TOGGLE: &str = "__TOGGLE__";

#[derive(Deserialize)]
struct UpdateVariable {
    variable: AnyVariable,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct TriggerVariable {
    variable: AnyVariable,
    #[serde(default = "default_force")]
    force: bool,
}

fn default_force() -> bool {
    true
}

#[derive(Deserialize)]
struct Navigate {
    url: String,
}

#[derive(Deserialize)]
struct ResetVariables {
    variables: Vec<AnyVariable>,
}

pub(crate) fn register_builtins(runtime: &Runtime) {
    runtime.register_handler("UpdateVariable", update_variable);
    runtime.register_handler("TriggerVariable", trigger_variable);
    runtime.register_handler("Navigate", navigate);
    runtime.register_handler("ResetVariables", reset_variables);
    runtime.register_handler("Notify", notify);
}

async fn update_variable(ctx: ActionContext, action: ActionDef) -> Result<()> {
    let UpdateVariable { variable, value } = action.parse_args()?;
    let value = match value.as_str() {
        Some(INPUT) => ctx.input.clone(),
        Some(TOGGLE) => {
            let current = ctx.resolve(&variable).await?;
            Value::Bool(!current.as_bool().unwrap_or(false))
        }
        _ => value,
    };
    ctx.runtime.set(&variable, value, &ctx.extras)
}

async fn trigger_variable(ctx: ActionContext, action: ActionDef) -> Result<()> {
    let TriggerVariable { variable, force } = action.parse_args()?;
    ctx.runtime.trigger(&variable, force, &ctx.extras).await?;
    Ok(())
}

async fn navigate(ctx: ActionContext, action: ActionDef) -> Result<()> {
    let Navigate { url } = action.parse_args()?;
    ctx.runtime.navigate(&url)
}

async fn reset_variables(ctx: ActionContext, action: ActionDef) -> Result<()> {
    let ResetVariables { variables } = action.parse_args()?;
    for variable in &variables {
        ctx.runtime.reset(variable)?;
    }
    Ok(())
}

async fn notify(ctx: ActionContext, action: ActionDef) -> Result<()> {
    let notification: Notification = action.parse_args()?;
    ctx.notify(notification);
    Ok(())
}
