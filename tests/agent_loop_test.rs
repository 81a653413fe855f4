//! End-to-end orchestration: scripted model, in-process tool server.

mod common;

use common::*;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolwire::progress::ProgressEvent;
use toolwire::{
    Agent, AgentOptions, ChatRequest, ClientOptions, CompletionResponse, Connection,
    DEFAULT_FALLBACK_MESSAGE, Error, HistoryTurn, InvocationStatus, MessageRole, ToolSet,
    ContentBlock, Tool, ToolResultBlock, remote_tools,
};

fn search_server() -> Handler {
    tool_server(
        json!([tool_descriptor("search"), tool_descriptor("fetch")]),
        |name, args| {
            let query = args["query"].as_str().unwrap_or_default();
            match (name, query) {
                (_, "explode") => Reply::Result(error_content("index unavailable")),
                (_, "slow") => Reply::Delayed(
                    Duration::from_millis(60),
                    text_content(&format!("{} result for slow", name)),
                ),
                _ => Reply::Result(text_content(&format!("{} result for {}", name, query))),
            }
        },
    )
}

fn tool_results(message: &toolwire::Message) -> Vec<ToolResultBlock> {
    message
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_remote_tool_returns_unwrapped_content() {
    init_logger();
    let handler = tool_server(json!([tool_descriptor("greet")]), |_, args| {
        Reply::Result(json!({"content": format!("hello {}", args["query"].as_str().unwrap_or(""))}))
    });
    let (server, events) = FakeServer::start(handler);
    let connection = Connection::from_transport(server, events, ClientOptions::default())
        .await
        .unwrap();

    let tools = remote_tools(&connection).await.unwrap();
    let greet = tools.get("greet").unwrap();
    assert_eq!(greet.description(), "The greet tool");
    assert_eq!(greet.input_schema()["additionalProperties"], false);
    assert_eq!(greet.input_schema()["required"], json!(["query"]));

    let result = tools.invoke("greet", json!({"query": "ada"})).await.unwrap();
    assert_eq!(result, json!("hello ada"));
}

#[tokio::test]
async fn test_remote_tool_error_flag_becomes_error() {
    let handler = tool_server(json!([tool_descriptor("search")]), |_, _| {
        Reply::Result(error_content("quota exceeded"))
    });
    let (server, events) = FakeServer::start(handler);
    let connection = Connection::from_transport(server, events, ClientOptions::default())
        .await
        .unwrap();

    let tools = remote_tools(&connection).await.unwrap();
    match tools.invoke("search", json!({"query": "x"})).await.unwrap_err() {
        Error::ToolExecution(msg) => assert_eq!(msg, "quota exceeded"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_two_tool_rounds_then_answer() {
    init_logger();
    let connector = FakeConnector::new(search_server());
    let completion = ScriptedCompletion::new(vec![
        tool_response(&[("call_1", "search", json!({"query": "revenue"}))]),
        tool_response(&[("call_2", "fetch", json!({"query": "q3 report"}))]),
        text_response("Revenue grew 12% in Q3."),
    ]);
    let agent = Agent::new(test_options(), completion.clone()).with_connector(connector.clone());

    let reply = agent
        .respond(ChatRequest::new("How did revenue do?"), None)
        .await;

    assert_eq!(reply.text, "Revenue grew 12% in Q3.");
    assert!(!reply.used_fallback);
    assert!(reply.tools_available);
    assert_eq!(reply.rounds, 2);
    assert_eq!(reply.invocations.len(), 2);
    assert_eq!(
        reply.invocations[1].status(),
        &InvocationStatus::Succeeded {
            result: "fetch result for q3 report".to_string()
        }
    );

    let requests = completion.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].tools.len(), 2);
    assert_eq!(requests[0].system_prompt, "You are a test assistant");

    let roles: Vec<MessageRole> = requests[2].messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant,
            MessageRole::Tool,
        ]
    );
    assert_eq!(
        tool_results(&requests[2].messages[2]),
        vec![ToolResultBlock::success("call_1", "search result for revenue")]
    );

    // one connection for the whole request, discovered once, closed at the end
    assert_eq!(connector.servers().len(), 1);
    let server = connector.last_server();
    assert_eq!(server.requests("tools/list").len(), 1);
    assert_eq!(server.requests("tools/call").len(), 2);
    assert_eq!(server.close_count(), 1);
}

#[tokio::test]
async fn test_concurrent_invocations_keep_request_order() {
    let connector = FakeConnector::new(search_server());
    let completion = ScriptedCompletion::new(vec![
        tool_response(&[
            ("call_slow", "search", json!({"query": "slow"})),
            ("call_fast", "fetch", json!({"query": "fast"})),
        ]),
        text_response("done"),
    ]);
    let agent = Agent::new(test_options(), completion.clone()).with_connector(connector);

    let reply = agent.respond(ChatRequest::new("both please"), None).await;
    assert_eq!(reply.text, "done");

    let requests = completion.requests();
    let results = tool_results(&requests[1].messages[2]);
    assert_eq!(
        results,
        vec![
            ToolResultBlock::success("call_slow", "search result for slow"),
            ToolResultBlock::success("call_fast", "fetch result for fast"),
        ]
    );
    // one batched tool turn, not one per invocation
    assert_eq!(requests[1].messages.len(), 3);
}

#[tokio::test]
async fn test_failed_tool_is_reported_to_model() {
    let connector = FakeConnector::new(search_server());
    let completion = ScriptedCompletion::new(vec![
        tool_response(&[
            ("call_1", "search", json!({"query": "explode"})),
            ("call_2", "missing_tool", json!({})),
        ]),
        text_response("The search index is down right now."),
    ]);
    let agent = Agent::new(test_options(), completion.clone()).with_connector(connector.clone());

    let reply = agent.respond(ChatRequest::new("search it"), None).await;
    assert_eq!(reply.text, "The search index is down right now.");
    assert!(!reply.used_fallback);

    let results = tool_results(&completion.requests()[1].messages[2]);
    assert_eq!(
        results,
        vec![
            ToolResultBlock::error("call_1", "index unavailable"),
            ToolResultBlock::error("call_2", "Tool not found: missing_tool"),
        ]
    );
    assert!(matches!(
        reply.invocations[0].status(),
        InvocationStatus::Failed { .. }
    ));
    assert_eq!(connector.last_server().close_count(), 1);
}

#[tokio::test]
async fn test_missing_content_uses_fallback() {
    let completion = ScriptedCompletion::new(vec![Ok(CompletionResponse {
        stop_reason: Some("end_turn".to_string()),
        content: None,
    })]);
    let agent = Agent::new(test_options(), completion);

    let reply = agent.respond(ChatRequest::new("hello"), None).await;
    assert_eq!(reply.text, DEFAULT_FALLBACK_MESSAGE);
    assert!(reply.used_fallback);
    assert!(!reply.tools_available);
}

#[tokio::test]
async fn test_completion_failure_uses_configured_fallback() {
    let completion = ScriptedCompletion::new(vec![Err(Error::api("API error 503: overloaded"))]);
    let options = AgentOptions {
        fallback_message: "Try again later.".to_string(),
        ..test_options()
    };
    let agent = Agent::new(options, completion);

    let reply = agent.respond(ChatRequest::new("hello"), None).await;
    assert_eq!(reply.text, "Try again later.");
    assert!(reply.used_fallback);
}

#[tokio::test]
async fn test_unreachable_tool_server_degrades_to_no_tools() {
    let completion = ScriptedCompletion::new(vec![text_response("Answer without tools.")]);
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let sink = move |event: ProgressEvent| seen.lock().unwrap().push(event);

    let agent = Agent::new(test_options(), completion.clone())
        .with_connector(Arc::new(UnreachableConnector));
    let reply = agent.respond(ChatRequest::new("hi"), Some(&sink)).await;

    assert_eq!(reply.text, "Answer without tools.");
    assert!(!reply.tools_available);
    assert!(completion.requests()[0].tools.is_empty());

    let events = events.lock().unwrap();
    assert_eq!(events[0], ProgressEvent::LoadingTools);
    assert!(matches!(events[1], ProgressEvent::ToolsUnavailable { .. }));
}

#[tokio::test]
async fn test_slow_discovery_times_out_and_closes() {
    let handler = tool_server(json!([]), |_, _| Reply::Silent);
    let silent_listing: Handler = Arc::new(move |method: &str, params: &Value| match method {
        "tools/list" => Reply::Silent,
        _ => handler(method, params),
    });
    let connector = FakeConnector::new(silent_listing);
    let completion = ScriptedCompletion::new(vec![text_response("no tools needed")]);
    let options = AgentOptions {
        tool_timeout: Some(Duration::from_millis(100)),
        ..test_options()
    };
    let agent = Agent::new(options, completion.clone()).with_connector(connector.clone());

    let reply = agent.respond(ChatRequest::new("hi"), None).await;
    assert_eq!(reply.text, "no tools needed");
    assert!(!reply.tools_available);
    assert_eq!(connector.last_server().close_count(), 1);
}

#[tokio::test]
async fn test_broken_connection_during_round_falls_back() {
    let handler = tool_server(json!([tool_descriptor("search")]), |_, _| Reply::CloseStream);
    let connector = FakeConnector::new(handler);
    let completion = ScriptedCompletion::new(vec![
        tool_response(&[("call_1", "search", json!({"query": "x"}))]),
        text_response("never reached"),
    ]);
    let agent = Agent::new(test_options(), completion.clone()).with_connector(connector.clone());

    let reply = agent.respond(ChatRequest::new("search"), None).await;
    assert_eq!(reply.text, DEFAULT_FALLBACK_MESSAGE);
    assert!(reply.used_fallback);
    assert_eq!(completion.requests().len(), 1);
    assert_eq!(connector.last_server().close_count(), 1);
}

#[tokio::test]
async fn test_tool_round_timeout_falls_back() {
    let handler = tool_server(json!([tool_descriptor("search")]), |_, _| Reply::Silent);
    let connector = FakeConnector::new(handler);
    let completion = ScriptedCompletion::new(vec![tool_response(&[(
        "call_1",
        "search",
        json!({"query": "x"}),
    )])]);
    let options = AgentOptions {
        tool_timeout: Some(Duration::from_millis(100)),
        ..test_options()
    };
    let agent = Agent::new(options, completion.clone()).with_connector(connector.clone());

    let reply = agent.respond(ChatRequest::new("search"), None).await;
    assert!(reply.used_fallback);
    assert!(matches!(
        reply.invocations[0].status(),
        InvocationStatus::Failed { .. }
    ));
    assert_eq!(connector.last_server().close_count(), 1);
}

#[tokio::test]
async fn test_round_limit_stops_the_loop() {
    let tools: ToolSet = [Tool::new("noop", "Does nothing", json!({}), |_| async {
        Ok(json!("ok"))
    })]
    .into_iter()
    .collect();
    let mut still_asking = tool_response(&[("call_2", "noop", json!({}))]).unwrap();
    still_asking
        .content
        .as_mut()
        .unwrap()
        .insert(0, ContentBlock::Text(toolwire::TextBlock::new("Still working on it.")));

    let completion = ScriptedCompletion::new(vec![
        tool_response(&[("call_1", "noop", json!({}))]),
        Ok(still_asking),
    ]);
    let options = AgentOptions {
        max_tool_rounds: 1,
        ..test_options()
    };
    let agent = Agent::new(options, completion.clone()).with_tools(tools);

    let reply = agent.respond(ChatRequest::new("loop"), None).await;
    assert_eq!(reply.rounds, 1);
    assert_eq!(reply.text, "Still working on it.");
    assert_eq!(completion.requests().len(), 2);
}

#[tokio::test]
async fn test_history_window_limits_prior_turns() {
    let history: Vec<HistoryTurn> = (0..30)
        .map(|i| {
            if i % 2 == 0 {
                HistoryTurn::user(format!("question {}", i))
            } else {
                HistoryTurn::assistant(format!("answer {}", i))
            }
        })
        .collect();
    let completion = ScriptedCompletion::new(vec![text_response("ok")]);
    let agent = Agent::new(test_options(), completion.clone());

    agent
        .respond(ChatRequest::new("latest").with_history(history), None)
        .await;

    let messages = &completion.requests()[0].messages;
    assert_eq!(messages.len(), 11);
    assert_eq!(messages[0].first_text(), Some("question 20"));
    assert_eq!(messages[10].first_text(), Some("latest"));
}

#[tokio::test]
async fn test_progress_events_follow_the_loop() {
    let connector = FakeConnector::new(search_server());
    let completion = ScriptedCompletion::new(vec![
        tool_response(&[("call_1", "search", json!({"query": "a"}))]),
        text_response("done"),
    ]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let agent = Agent::new(test_options(), completion).with_connector(connector);

    agent.respond(ChatRequest::new("go"), Some(&tx)).await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            ProgressEvent::LoadingTools,
            ProgressEvent::ToolsReady { count: 2 },
            ProgressEvent::Thinking { round: 0 },
            ProgressEvent::UsingTool {
                name: "search".to_string()
            },
            ProgressEvent::ToolFinished {
                name: "search".to_string(),
                success: true
            },
            ProgressEvent::Thinking { round: 1 },
        ]
    );
}
