use echorpc::common::in_memory_client;
use echorpc::{BurstConfig, ConnectionConfig, Content, EchoClient, Message, StreamDriver};
use proptest::prelude::*;

fn echo_client() -> EchoClient {
    EchoClient::new(
        in_memory_client("echo", 1024, ConnectionConfig::default()),
        "echo",
    )
}

fn any_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        ".{0,256}".prop_map(Message::Text),
        (".{0,128}", ".{0,32}").prop_map(|(body, author)| Message::from(Content::new(body, author))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a unary call returns exactly the message that was sent, at index 1
    #[test]
    fn unary_echo_preserves_message(message in any_message()) {
        tokio_test::block_on(async {
            let client = echo_client();

            let response = client.echo(message.clone()).await
                .map_err(|e| TestCaseError::fail(format!("Echo failed: {e}")))?;

            prop_assert_eq!(response.index, 1);
            prop_assert_eq!(response.message, message);
            Ok(())
        })?;
    }

    /// Property: a repeat call yields exactly `count` responses numbered 1..=count
    #[test]
    fn repeat_numbers_every_response(message in any_message(), count in 0u32..40) {
        tokio_test::block_on(async {
            let client = echo_client();

            let responses = client.repeat(message.clone(), count).await
                .map_err(|e| TestCaseError::fail(format!("Repeat failed: {e}")))?;

            prop_assert_eq!(responses.len(), count as usize);
            for (i, response) in responses.iter().enumerate() {
                prop_assert_eq!(response.index, i as i32 + 1);
                prop_assert_eq!(&response.message, &message);
            }
            Ok(())
        })?;
    }

    /// Property: a burst of N messages gets N responses, in order, indexed 1..=N
    #[test]
    fn burst_responses_follow_send_order(count in 0usize..120) {
        tokio_test::block_on(async {
            let client = echo_client();
            let driver = StreamDriver::new(BurstConfig::default().with_count(count));

            let responses = driver.run(&client).await
                .map_err(|e| TestCaseError::fail(format!("Burst failed: {e}")))?;

            prop_assert_eq!(responses.len(), count);
            for (i, response) in responses.iter().enumerate() {
                prop_assert_eq!(response.index, i as i32 + 1);
                prop_assert_eq!(&response.message, &Message::from(format!("hello-{i}")));
            }
            Ok(())
        })?;
    }
}
