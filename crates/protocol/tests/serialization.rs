use rk_protocol::*;

#[test]
fn test_pipeline_deserialization_from_yaml() {
    let yaml_str = r#"
id: story-pipeline
name: Story Pipeline
delivery:
  mode: synthesis
phases:
  - id: outline
    name: Outline
    continue_on_error: false
    actions:
      - id: draft-outline
        name: Draft Outline
        kind: standard
        agent: outliner
        template: "Outline a story about {{input}}"
        shape: text
      - id: review-outline
        name: Review Outline
        kind: user_gavel
        gavel:
          prompt: "Approve this outline?"
          can_skip: true
  - id: prose
    name: Prose
    consolidation:
      policy: last_action
    actions:
      - id: write-prose
        name: Write Prose
        kind: standard
        agent: writer
        input:
          source: previous_step
        template: "Expand: {{previousOutput}}"
"#;

    let pipeline: PipelineDefinition =
        serde_yaml::from_str(yaml_str).expect("Failed to deserialize PipelineDefinition");

    assert_eq!(pipeline.id, "story-pipeline");
    assert_eq!(pipeline.phases.len(), 2);
    assert_eq!(pipeline.delivery, DeliveryMode::Synthesis);
    assert_eq!(pipeline.phases[0].actions.len(), 2);
    assert_eq!(pipeline.phases[0].actions[1].kind, ActionKind::UserGavel);
    assert!(pipeline.phases[0].actions[1]
        .gavel
        .as_ref()
        .is_some_and(|g| g.can_skip));
    assert_eq!(
        pipeline.phases[1].actions[0].input,
        InputSource::PreviousStep
    );
    assert!(pipeline.validate().is_ok());
}

#[test]
fn test_legacy_steps_field_deserializes_into_actions() {
    let yaml_str = r#"
id: legacy
name: Legacy
phases:
  - id: only
    name: Only
    steps:
      - id: a1
        name: A1
        kind: system
"#;

    let pipeline: PipelineDefinition =
        serde_yaml::from_str(yaml_str).expect("Failed to deserialize legacy pipeline");
    assert_eq!(pipeline.phases[0].actions.len(), 1);
}

#[test]
fn test_action_defaults() {
    let yaml_str = r#"
id: a1
name: A1
kind: standard
"#;
    let action: ActionDefinition =
        serde_yaml::from_str(yaml_str).expect("Failed to deserialize ActionDefinition");

    assert_eq!(action.input, InputSource::PreviousStep);
    assert_eq!(action.output, OutputTarget::NextStep);
    assert_eq!(action.shape, OutputShape::Text);
    assert_eq!(action.execution, OrchestrationMode::Sequential);
    assert_eq!(action.retry.max_attempts, 3);
    assert_eq!(action.retry.base_delay_ms, 1000);
    assert!(!action.export);
}

#[test]
fn test_agent_config_serialization() {
    let agent = AgentConfig {
        name: "writer".to_string(),
        description: "Drafts prose".to_string(),
        model: "claude-sonnet-4".to_string(),
        system_prompt: "You write fiction.".to_string(),
        generation: GenerationConfig {
            temperature: 0.9,
            max_tokens: 2048,
            timeout_ms: Some(30_000),
        },
    };

    let json = serde_json::to_string(&agent).expect("Failed to serialize AgentConfig");
    let deserialized: AgentConfig =
        serde_json::from_str(&json).expect("Failed to deserialize AgentConfig");

    assert_eq!(deserialized.name, agent.name);
    assert_eq!(deserialized.generation.max_tokens, 2048);
    assert_eq!(deserialized.generation.timeout_ms, Some(30_000));
}

#[test]
fn test_run_status_serialization() {
    let status = RunStatus::Running;
    let json = serde_json::to_value(status).expect("Failed to serialize RunStatus");
    assert_eq!(json, "RUNNING");

    let deserialized: RunStatus =
        serde_json::from_value(json).expect("Failed to deserialize RunStatus");
    assert_eq!(deserialized, RunStatus::Running);
}

#[test]
fn test_error_kind_snake_case() {
    let json = serde_json::to_value(ErrorKind::Llm).expect("Failed to serialize ErrorKind");
    assert_eq!(json, "llm");

    let json = serde_json::to_value(ErrorKind::Cancelled).expect("serialize");
    assert_eq!(json, "cancelled");
}

#[test]
fn test_pipeline_error_round_trip() {
    let err = PipelineError::new(ErrorKind::Timeout, "deadline exceeded").with_step("draft");
    let json = serde_json::to_string(&err).expect("Failed to serialize PipelineError");
    let deserialized: PipelineError =
        serde_json::from_str(&json).expect("Failed to deserialize PipelineError");

    assert_eq!(deserialized.kind, ErrorKind::Timeout);
    assert!(deserialized.retryable);
    assert_eq!(deserialized.step_id.as_deref(), Some("draft"));
}

#[test]
fn test_event_enum_serialization() {
    use uuid::Uuid;

    let run_id = Uuid::new_v4();
    let event = Event::Progress {
        run_id,
        phase: "Outline".to_string(),
        stage: ProgressStage::LlmCalling,
        percentage: 25.0,
        actions_completed: 1,
        actions_total: 4,
    };

    let json = serde_json::to_value(&event).expect("Failed to serialize Event");
    assert_eq!(json["type"], "progress");
    assert_eq!(json["payload"]["stage"], "llm_calling");

    let deserialized: Event = serde_json::from_value(json).expect("Failed to deserialize Event");
    match deserialized {
        Event::Progress { stage, actions_total, .. } => {
            assert_eq!(stage, ProgressStage::LlmCalling);
            assert_eq!(actions_total, 4);
        }
        _ => panic!("Wrong variant"),
    }
}

#[test]
fn test_delivery_mode_injection_mappings() {
    let yaml_str = r#"
mode: injection
mappings:
  "{{lore}}": lore-pipeline
  "{{style}}": style-pipeline
"#;
    let mode: DeliveryMode =
        serde_yaml::from_str(yaml_str).expect("Failed to deserialize DeliveryMode");
    match mode {
        DeliveryMode::Injection { mappings } => {
            assert_eq!(mappings.len(), 2);
            assert_eq!(mappings["{{lore}}"], "lore-pipeline");
        }
        _ => panic!("Wrong variant"),
    }
}
