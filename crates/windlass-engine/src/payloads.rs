//! Event payload shapes.
//!
//! Everything persisted in `event_data` goes through the workflow or step
//! boundary of the codec. These helpers pin the field names each event type
//! carries so the engine and the handlers stay in agreement.

use chrono::{DateTime, Utc};

use windlass_codec::{dehydrate, hydrate_versioned, Boundary, CodecError, Value};
use windlass_core::{StepError, StepName, WorkflowError, WorkflowName};

/// `step_created` — the serialized invocation.
pub fn encode_step_created(
    name: &StepName,
    args: &[Value],
    this_val: Option<&Value>,
    closure_vars: Option<&Value>,
) -> Result<Vec<u8>, CodecError> {
    let mut entries = vec![
        ("name".to_string(), Value::from(name.to_string())),
        ("args".to_string(), Value::Array(args.to_vec())),
    ];
    if let Some(this_val) = this_val {
        entries.push(("thisVal".to_string(), this_val.clone()));
    }
    if let Some(closure_vars) = closure_vars {
        entries.push(("closureVars".to_string(), closure_vars.clone()));
    }
    dehydrate(&Value::object(entries), Boundary::Workflow, "step arguments")
}

/// Decoded `step_created` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInvocation {
    pub name: StepName,
    pub args: Vec<Value>,
    pub this_val: Option<Value>,
    pub closure_vars: Option<Value>,
}

/// Reads a serialized step invocation (step-boundary revivers).
pub fn decode_step_invocation(
    bytes: &[u8],
    spec_version: u32,
) -> Result<StepInvocation, CodecError> {
    let value = hydrate_versioned(bytes, spec_version, Boundary::Step, "step arguments")?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::malformed("step arguments", &[], "missing step name"))?
        .parse::<StepName>()
        .map_err(|e| CodecError::malformed("step arguments", &[], e.to_string()))?;
    let args = match value.get("args") {
        Some(Value::Array(args)) => args.clone(),
        _ => vec![],
    };
    Ok(StepInvocation {
        name,
        args,
        this_val: value.get("thisVal").cloned(),
        closure_vars: value.get("closureVars").cloned(),
    })
}

/// `step_started` / `step_retrying` — the attempt counter.
pub fn encode_attempt(attempt: u32) -> Result<Vec<u8>, CodecError> {
    dehydrate(
        &Value::object([("attempt", Value::from(f64::from(attempt)))]),
        Boundary::Workflow,
        "step attempt",
    )
}

/// `step_completed` — `{result}` in step-boundary encoding.
pub fn encode_step_result(result: &Value) -> Result<Vec<u8>, CodecError> {
    dehydrate(
        &Value::object([("result", result.clone())]),
        Boundary::Step,
        "step return value",
    )
}

/// Reads `{result}` back with workflow-boundary revivers.
pub fn decode_step_result(bytes: &[u8], spec_version: u32) -> Result<Value, CodecError> {
    let value = hydrate_versioned(bytes, spec_version, Boundary::Workflow, "step result")?;
    Ok(value.get("result").cloned().unwrap_or(Value::Null))
}

/// `step_failed` — `{error: {message, stack}}`.
pub fn encode_step_failure(error: &StepError) -> Result<Vec<u8>, CodecError> {
    let mut entries = vec![("message".to_string(), Value::from(error.message.clone()))];
    if let Some(stack) = &error.stack {
        entries.push(("stack".to_string(), Value::from(stack.clone())));
    }
    dehydrate(
        &Value::object([("error", Value::object(entries))]),
        Boundary::Step,
        "step failure",
    )
}

/// Reconstructs the error a rejected step `await` carries into workflow code.
pub fn decode_step_failure(bytes: &[u8], spec_version: u32) -> Result<WorkflowError, CodecError> {
    let value = hydrate_versioned(bytes, spec_version, Boundary::Workflow, "step failure")?;
    let error = value.get("error").cloned().unwrap_or(Value::Null);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("step failed")
        .to_string();
    let mut out = WorkflowError::new(message);
    if let Some(stack) = error.get("stack").and_then(Value::as_str) {
        out = out.with_stack(stack);
    }
    Ok(out)
}

/// `wait_created` — `{resumeAt}`.
pub fn encode_wait_created(resume_at: DateTime<Utc>) -> Result<Vec<u8>, CodecError> {
    dehydrate(
        &Value::object([("resumeAt", Value::Date(resume_at))]),
        Boundary::Workflow,
        "wait metadata",
    )
}

/// Reads `{resumeAt}` back.
pub fn decode_wait_created(
    bytes: &[u8],
    spec_version: u32,
) -> Result<DateTime<Utc>, CodecError> {
    let value = hydrate_versioned(bytes, spec_version, Boundary::Workflow, "wait metadata")?;
    match value.get("resumeAt") {
        Some(Value::Date(at)) => Ok(*at),
        _ => Err(CodecError::malformed(
            "wait metadata",
            &[],
            "missing resumeAt",
        )),
    }
}

/// `hook_created` — `{token, metadata?, staticResponse?}`.
pub fn encode_hook_created(
    token: &str,
    metadata: Option<&Value>,
    static_response: Option<&Value>,
) -> Result<Vec<u8>, CodecError> {
    let mut entries = vec![("token".to_string(), Value::from(token))];
    if let Some(metadata) = metadata {
        entries.push(("metadata".to_string(), metadata.clone()));
    }
    if let Some(static_response) = static_response {
        entries.push(("staticResponse".to_string(), static_response.clone()));
    }
    dehydrate(&Value::object(entries), Boundary::Workflow, "hook metadata")
}

/// Decoded `hook_created` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct HookInfo {
    pub token: String,
    pub metadata: Option<Value>,
    pub static_response: Option<Value>,
}

/// Reads a `hook_created` payload back.
pub fn decode_hook_created(bytes: &[u8], spec_version: u32) -> Result<HookInfo, CodecError> {
    let value = hydrate_versioned(bytes, spec_version, Boundary::Workflow, "hook metadata")?;
    let token = value
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::malformed("hook metadata", &[], "missing token"))?
        .to_string();
    Ok(HookInfo {
        token,
        metadata: value.get("metadata").cloned(),
        static_response: value.get("staticResponse").cloned(),
    })
}

/// `hook_received` — the delivered payload itself.
pub fn encode_hook_payload(payload: &Value) -> Result<Vec<u8>, CodecError> {
    dehydrate(payload, Boundary::Workflow, "hook payload")
}

/// Reads a hook payload back.
pub fn decode_hook_payload(bytes: &[u8], spec_version: u32) -> Result<Value, CodecError> {
    hydrate_versioned(bytes, spec_version, Boundary::Workflow, "hook payload")
}

/// `run_completed` — the serialized return value (intra-run boundary).
pub fn encode_run_output(output: &Value) -> Result<Vec<u8>, CodecError> {
    dehydrate(output, Boundary::Workflow, "workflow return value")
}

/// `run_failed` — `{message, stack}`.
pub fn encode_run_failure(error: &WorkflowError) -> Result<Vec<u8>, CodecError> {
    let mut entries = vec![("message".to_string(), Value::from(error.message.clone()))];
    if let Some(stack) = &error.stack {
        entries.push(("stack".to_string(), Value::from(stack.clone())));
    }
    dehydrate(&Value::object(entries), Boundary::Workflow, "run failure")
}

/// Spawn-step arguments — `{workflow, input}`.
pub fn encode_spawn_args(
    workflow: &WorkflowName,
    input: &Value,
) -> Result<Vec<Value>, CodecError> {
    Ok(vec![Value::object([
        ("workflow", Value::from(workflow.to_string())),
        ("input", input.clone()),
    ])])
}

/// Reads spawn-step arguments back.
pub fn decode_spawn_args(args: &[Value]) -> Result<(WorkflowName, Value), CodecError> {
    let descriptor = args
        .first()
        .ok_or_else(|| CodecError::malformed("spawn arguments", &[], "missing descriptor"))?;
    let workflow = descriptor
        .get("workflow")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::malformed("spawn arguments", &[], "missing workflow name"))?
        .parse::<WorkflowName>()
        .map_err(|e| CodecError::malformed("spawn arguments", &[], e.to_string()))?;
    let input = descriptor.get("input").cloned().unwrap_or(Value::Null);
    Ok((workflow, input))
}
