use std::fs;

use rsocket_core::{RSocketClient, SetupParameters};
use rsocket_frame::Payload;

use crate::cmd::{parse_duration, parse_endpoint, Interaction, RequestArgs};
use crate::exit::{io_error, rsocket_error, CliResult, SUCCESS};
use crate::output::{print_payload, OutputFormat, PayloadSource};

pub fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let timeout = parse_duration(&args.timeout)?;
    let payload = build_payload(&args)?;

    let client = RSocketClient::connect(&endpoint, SetupParameters::default())
        .map_err(|err| rsocket_error("connect failed", err))?;
    let peer = endpoint.to_string();

    let result = match args.interaction {
        Interaction::Response => client.request_response_blocking(payload, timeout).map(|response| {
            let source = PayloadSource {
                interaction: "response",
                stream_id: None,
                peer: &peer,
            };
            print_payload(&response, source, format);
        }),
        Interaction::Fnf => client.fire_and_forget(payload).map(|()| {
            tracing::info!(endpoint = %peer, "fire-and-forget sent");
        }),
        Interaction::Stream => client
            .request_stream_blocking(payload, args.request_n, timeout)
            .map(|items| {
                tracing::debug!(count = items.len(), "stream finished");
                for item in &items {
                    let source = PayloadSource {
                        interaction: "stream",
                        stream_id: None,
                        peer: &peer,
                    };
                    print_payload(item, source, format);
                }
            }),
    };

    client.close();
    result.map_err(|err| rsocket_error("request failed", err))?;
    Ok(SUCCESS)
}

fn build_payload(args: &RequestArgs) -> CliResult<Payload> {
    let data = match (&args.data, &args.file) {
        (Some(data), _) => data.clone().into_bytes(),
        (None, Some(path)) => {
            fs::read(path).map_err(|err| io_error(&format!("failed to read {}", path.display()), err))?
        }
        (None, None) => Vec::new(),
    };

    Ok(match &args.metadata {
        Some(metadata) => Payload::with_metadata(data, metadata.clone().into_bytes()),
        None => Payload::new(data),
    })
}
