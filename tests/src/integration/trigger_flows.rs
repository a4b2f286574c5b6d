//! # Remote Trigger Flows
//!
//! A workflow DON subscribes to a trigger hosted by a capability DON. Every
//! node runs its own dispatcher on the in-memory network.
//!
//! ```text
//! workflow DON (subscribers) ── RegisterTrigger ──► capability DON (publishers)
//!                            ◄── TriggerEvent ────  underlying FakeTrigger
//! ```

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use capability_bus::test_utils::{
        registration_request, trigger_capability_info, trigger_response, wait_until, FakeTrigger,
        MockTimeSource, TestDon, CAPABILITY_DON_ID, CAPABILITY_ID, WORKFLOW_DON_ID, WORKFLOW_ID_1,
        WORKFLOW_ID_2,
    };
    use capability_bus::{
        Dispatcher, InMemoryNetwork, ModeAggregator, SystemTimeSource, TimeSource,
        TriggerCapability, TriggerPublisher, TriggerSubscriber,
    };
    use shared_types::{MessageBody, Method, RemoteTriggerConfig};
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use crate::integration::{spawn_node, Node};

    const WAIT: Duration = Duration::from_secs(5);

    struct CapabilityNode {
        node: Node,
        publisher: TriggerPublisher,
        trigger: Arc<FakeTrigger>,
    }

    struct WorkflowNode {
        node: Node,
        subscriber: TriggerSubscriber,
    }

    fn remote_config(min_responses: u32, max_batch_size: u32) -> RemoteTriggerConfig {
        RemoteTriggerConfig {
            registration_refresh: Duration::from_millis(50),
            registration_expiry: Duration::from_secs(60),
            min_responses_to_aggregate: min_responses,
            message_expiry: Duration::from_secs(10),
            max_batch_size,
            batch_collection_period: Duration::from_millis(50),
        }
    }

    fn capability_nodes(
        network: &InMemoryNetwork,
        capability_don: &TestDon,
        workflow_don: &TestDon,
        config: RemoteTriggerConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Vec<CapabilityNode> {
        capability_don
            .keys
            .iter()
            .map(|key| {
                let node = spawn_node(network, key.clone());
                let trigger = FakeTrigger::new();
                let publisher = TriggerPublisher::new(
                    CAPABILITY_ID,
                    "",
                    node.dispatcher.clone(),
                    time_source.clone(),
                );
                publisher
                    .set_config(
                        Some(config.clone()),
                        trigger.clone(),
                        capability_don.don.clone(),
                        HashMap::from([(WORKFLOW_DON_ID, workflow_don.don.clone())]),
                    )
                    .unwrap();
                node.dispatcher
                    .set_receiver(CAPABILITY_ID, CAPABILITY_DON_ID, Arc::new(publisher.clone()))
                    .unwrap();
                publisher.start().unwrap();
                CapabilityNode {
                    node,
                    publisher,
                    trigger,
                }
            })
            .collect()
    }

    fn workflow_nodes(
        network: &InMemoryNetwork,
        capability_don: &TestDon,
        workflow_don: &TestDon,
        config: RemoteTriggerConfig,
    ) -> Vec<WorkflowNode> {
        let min_identical = capability_don.don.honest_agreement();
        workflow_don
            .keys
            .iter()
            .map(|key| {
                let node = spawn_node(network, key.clone());
                let subscriber = TriggerSubscriber::new(
                    CAPABILITY_ID,
                    "",
                    node.dispatcher.clone(),
                    Arc::new(SystemTimeSource),
                );
                subscriber
                    .set_config(
                        Some(config.clone()),
                        trigger_capability_info(),
                        WORKFLOW_DON_ID,
                        capability_don.don.clone(),
                        Some(Arc::new(ModeAggregator::new(min_identical))),
                    )
                    .unwrap();
                node.dispatcher
                    .set_receiver(CAPABILITY_ID, CAPABILITY_DON_ID, Arc::new(subscriber.clone()))
                    .unwrap();
                WorkflowNode { node, subscriber }
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_event_delivered_through_quorum() {
        let network = InMemoryNetwork::new();
        let capability_don = TestDon::new(CAPABILITY_DON_ID, 3, 1, 1);
        let workflow_don = TestDon::new(WORKFLOW_DON_ID, 3, 1, 11);
        let config = remote_config(2, 1);

        let publishers = capability_nodes(
            &network,
            &capability_don,
            &workflow_don,
            config.clone(),
            Arc::new(SystemTimeSource),
        );
        let subscribers = workflow_nodes(&network, &capability_don, &workflow_don, config);

        let mut streams = Vec::new();
        for wf in &subscribers {
            let events = wf
                .subscriber
                .register_trigger(registration_request(WORKFLOW_ID_1), CancellationToken::new())
                .await
                .unwrap();
            streams.push(events);
            wf.subscriber.start().unwrap();
        }

        // Every publisher needs all three workflow nodes (2F+1) to register.
        assert!(
            wait_until(WAIT, || publishers
                .iter()
                .all(|cap| cap.trigger.register_count() == 1))
            .await
        );

        let response = trigger_response("event-1", "triggerEvent1");
        for cap in &publishers {
            assert_eq!(cap.trigger.emit(&response), 1);
        }

        for events in &mut streams {
            let delivered = timeout(WAIT, events.recv()).await.unwrap().unwrap();
            assert_eq!(delivered, response);
        }

        // The third copy of the event does not produce a second delivery.
        tokio::time::sleep(Duration::from_millis(100)).await;
        for events in &mut streams {
            assert!(events.try_recv().is_err());
        }

        for wf in &subscribers {
            wf.subscriber.close().await;
            wf.node.dispatcher.close().await;
        }
        for cap in &publishers {
            cap.publisher.close().await;
            cap.node.dispatcher.close().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batched_event_reaches_every_workflow() {
        let network = InMemoryNetwork::new();
        let capability_don = TestDon::new(CAPABILITY_DON_ID, 1, 0, 1);
        let workflow_don = TestDon::new(WORKFLOW_DON_ID, 1, 0, 11);
        let config = remote_config(1, 10);

        let publishers = capability_nodes(
            &network,
            &capability_don,
            &workflow_don,
            config.clone(),
            Arc::new(SystemTimeSource),
        );
        let subscribers = workflow_nodes(&network, &capability_don, &workflow_don, config);
        let wf = &subscribers[0];
        let cap = &publishers[0];

        let mut events_1 = wf
            .subscriber
            .register_trigger(registration_request(WORKFLOW_ID_1), CancellationToken::new())
            .await
            .unwrap();
        let mut events_2 = wf
            .subscriber
            .register_trigger(registration_request(WORKFLOW_ID_2), CancellationToken::new())
            .await
            .unwrap();
        wf.subscriber.start().unwrap();

        assert!(wait_until(WAIT, || cap.trigger.register_count() == 2).await);

        let response = trigger_response("event-1", "triggerEvent1");
        assert_eq!(cap.trigger.emit(&response), 2);

        assert_eq!(timeout(WAIT, events_1.recv()).await.unwrap().unwrap(), response);
        assert_eq!(timeout(WAIT, events_2.recv()).await.unwrap().unwrap(), response);

        wf.subscriber.close().await;
        cap.publisher.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_expires_without_refresh() {
        let network = InMemoryNetwork::new();
        let capability_don = TestDon::new(CAPABILITY_DON_ID, 1, 0, 1);
        let workflow_don = TestDon::new(WORKFLOW_DON_ID, 1, 0, 11);
        let time = Arc::new(MockTimeSource::new(1_000_000));
        let config = RemoteTriggerConfig {
            registration_expiry: Duration::from_secs(1),
            // Also the publisher's cleanup period.
            message_expiry: Duration::from_millis(50),
            ..remote_config(1, 1)
        };

        let publishers =
            capability_nodes(&network, &capability_don, &workflow_don, config, time.clone());
        let cap = &publishers[0];

        // A workflow node that announces once and never refreshes.
        let workflow = spawn_node(&network, workflow_don.keys[0].clone());
        let registration = MessageBody::new(
            CAPABILITY_ID,
            CAPABILITY_DON_ID,
            "",
            WORKFLOW_DON_ID,
            Method::RegisterTrigger,
            registration_request(WORKFLOW_ID_1).encode().unwrap(),
        );
        workflow
            .dispatcher
            .send(cap.node.id, registration)
            .await
            .unwrap();

        assert!(wait_until(WAIT, || cap.trigger.register_count() == 1).await);
        assert!(cap.publisher.is_registered(WORKFLOW_DON_ID, WORKFLOW_ID_1).await);

        time.advance(Duration::from_secs(2));
        assert!(wait_until(WAIT, || cap.trigger.unregister_count() == 1).await);
        assert!(!cap.publisher.is_registered(WORKFLOW_DON_ID, WORKFLOW_ID_1).await);
        assert_eq!(cap.publisher.registration_count().await, 0);

        cap.publisher.close().await;
    }
}
