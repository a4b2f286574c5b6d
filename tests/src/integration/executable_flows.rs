//! # Remote Executable Flows
//!
//! Every workflow node calls the same step on a capability DON. Servers run
//! the underlying executable once enough workflow nodes asked for it.
//!
//! ```text
//! workflow DON (clients) ── Execute{message_id} ──► capability DON (servers)
//!                        ◄── Execute{response} ───  underlying FakeExecutable
//! ```

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use capability_bus::test_utils::{
        capability_request, executable_capability_info, wait_until, FakeExecutable, TestDon,
        CAPABILITY_DON_ID, CAPABILITY_ID, EXECUTION_ID_1, WORKFLOW_DON_ID,
    };
    use capability_bus::{
        CapabilityError, Dispatcher, ExecutableCapability, ExecutableClient, ExecutableServer,
        InMemoryNetwork, SystemTimeSource,
    };
    use shared_types::{ErrorCode, RemoteExecutableConfig, Value};
    use tokio::task::JoinSet;

    use crate::integration::{spawn_node, Node};

    const WAIT: Duration = Duration::from_secs(5);

    struct CapabilityNode {
        node: Node,
        server: ExecutableServer,
        executable: Arc<FakeExecutable>,
    }

    struct WorkflowNode {
        node: Node,
        client: ExecutableClient,
    }

    fn remote_config() -> RemoteExecutableConfig {
        RemoteExecutableConfig {
            request_timeout: Duration::from_secs(10),
            server_max_parallel_requests: 2,
        }
    }

    fn capability_nodes(
        network: &InMemoryNetwork,
        capability_don: &TestDon,
        workflow_don: &TestDon,
    ) -> Vec<CapabilityNode> {
        capability_don
            .keys
            .iter()
            .map(|key| {
                let node = spawn_node(network, key.clone());
                let executable = FakeExecutable::new();
                let server = ExecutableServer::new(
                    CAPABILITY_ID,
                    "",
                    node.dispatcher.clone(),
                    Arc::new(SystemTimeSource),
                );
                server
                    .set_config(
                        Some(remote_config()),
                        executable.clone(),
                        executable_capability_info(),
                        capability_don.don.clone(),
                        HashMap::from([(WORKFLOW_DON_ID, workflow_don.don.clone())]),
                    )
                    .unwrap();
                node.dispatcher
                    .set_receiver(CAPABILITY_ID, CAPABILITY_DON_ID, Arc::new(server.clone()))
                    .unwrap();
                server.start().unwrap();
                CapabilityNode {
                    node,
                    server,
                    executable,
                }
            })
            .collect()
    }

    fn workflow_nodes(
        network: &InMemoryNetwork,
        capability_don: &TestDon,
        workflow_don: &TestDon,
    ) -> Vec<WorkflowNode> {
        workflow_don
            .keys
            .iter()
            .map(|key| {
                let node = spawn_node(network, key.clone());
                let client = ExecutableClient::new(CAPABILITY_ID, "", node.dispatcher.clone());
                client
                    .set_config(
                        Some(remote_config()),
                        executable_capability_info(),
                        WORKFLOW_DON_ID,
                        capability_don.don.clone(),
                    )
                    .unwrap();
                node.dispatcher
                    .set_receiver(CAPABILITY_ID, CAPABILITY_DON_ID, Arc::new(client.clone()))
                    .unwrap();
                WorkflowNode { node, client }
            })
            .collect()
    }

    async fn shutdown(servers: &[CapabilityNode], clients: &[WorkflowNode]) {
        for wf in clients {
            wf.client.close();
            wf.node.dispatcher.close().await;
        }
        for cap in servers {
            cap.server.close().await;
            cap.node.dispatcher.close().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_runs_once_per_server() {
        let network = InMemoryNetwork::new();
        let capability_don = TestDon::new(CAPABILITY_DON_ID, 3, 1, 1);
        let workflow_don = TestDon::new(WORKFLOW_DON_ID, 3, 1, 11);
        let servers = capability_nodes(&network, &capability_don, &workflow_don);
        let clients = workflow_nodes(&network, &capability_don, &workflow_don);

        let mut calls = JoinSet::new();
        for wf in &clients {
            let client = wf.client.clone();
            calls.spawn(async move {
                client
                    .execute(capability_request(EXECUTION_ID_1, Value::from("in")))
                    .await
            });
        }
        while let Some(result) = calls.join_next().await {
            let response = result.unwrap().unwrap();
            assert_eq!(response.value, Value::from("in"));
        }

        assert!(
            wait_until(WAIT, || servers
                .iter()
                .all(|cap| cap.executable.call_count() == 1))
            .await
        );
        for wf in &clients {
            assert_eq!(wf.client.pending_requests(), 0);
        }

        shutdown(&servers, &clients).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_failure_reaches_every_caller() {
        let network = InMemoryNetwork::new();
        let capability_don = TestDon::new(CAPABILITY_DON_ID, 3, 1, 1);
        let workflow_don = TestDon::new(WORKFLOW_DON_ID, 3, 1, 11);
        let servers = capability_nodes(&network, &capability_don, &workflow_don);
        let clients = workflow_nodes(&network, &capability_don, &workflow_don);

        let mut calls = JoinSet::new();
        for wf in &clients {
            let client = wf.client.clone();
            calls.spawn(async move {
                client
                    .execute(capability_request(EXECUTION_ID_1, Value::Null))
                    .await
            });
        }
        while let Some(result) = calls.join_next().await {
            match result.unwrap() {
                Err(CapabilityError::Remote { code, message }) => {
                    assert_eq!(code, ErrorCode::Internal);
                    assert_eq!(message, "execution failed");
                }
                other => panic!("expected remote error, got {other:?}"),
            }
        }

        shutdown(&servers, &clients).await;
    }
}
