use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use modbus_poller::api::{LocalApi, ModbusApi};
use modbus_poller::config::PollerConfig;
use modbus_poller::discovery::{candidate_hosts, SubnetPrefix};
use modbus_poller::poller::{PollSettings, PollTarget, Poller};
use modbus_poller::registry::DeviceRegistry;
use modbus_poller::request::{
    ConnectParams, DataKind, ReadParams, ScanParams, WriteCoilParams, WriteRegisterParams,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{EndpointArgs, ReadArgs, ScanArgs, WatchArgs, WriteCoilArgs, WriteRegisterArgs};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_subnet(subnet: &str) -> Result<SubnetPrefix> {
    let octets = subnet
        .split('.')
        .map(str::parse::<u8>)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid subnet {subnet:?}"))?;
    match octets[..] {
        [a, b, c] | [a, b, c, 0] => Ok([a, b, c]),
        _ => bail!("subnet {subnet:?} must have three octets, e.g. 192.168.1"),
    }
}

pub async fn scan(api: &LocalApi, args: ScanArgs) -> Result<()> {
    let params = ScanParams {
        timeout_ms: args.timeout_ms,
    };

    let found = match args.subnet {
        Some(subnet) => {
            let timeout = api.scanner().probe_timeout(&params)?;
            let prefix = parse_subnet(&subnet)?;
            let hosts = candidate_hosts(&BTreeSet::from([prefix]));
            api.scanner().scan_hosts(hosts, timeout).await
        }
        None => api.scan(params).await?,
    };
    print_json(&found)
}

pub async fn connect(api: &LocalApi, endpoint: &EndpointArgs) -> Result<()> {
    let connected = api.connect(endpoint.into()).await?;
    print_json(&connected)
}

pub async fn read(api: &LocalApi, args: ReadArgs) -> Result<()> {
    let endpoint = ConnectParams::from(&args.endpoint);
    let params = ReadParams {
        endpoint: endpoint.clone(),
        address: args.address,
        length: args.length,
    };
    // Validate before dialing so bad input never reaches the network.
    params.validate(args.kind.into())?;
    api.connect(endpoint).await?;

    match DataKind::from(args.kind) {
        DataKind::Coils => print_json(&api.read_coils(params).await?),
        DataKind::DiscreteInputs => print_json(&api.read_discrete_inputs(params).await?),
        DataKind::HoldingRegisters => print_json(&api.read_holding_registers(params).await?),
        DataKind::InputRegisters => print_json(&api.read_input_registers(params).await?),
    }
}

pub async fn write_coil(api: &LocalApi, args: WriteCoilArgs) -> Result<()> {
    let params = WriteCoilParams {
        endpoint: (&args.endpoint).into(),
        address: args.address,
        state: args.state,
    };
    params.validate()?;
    api.connect(params.endpoint.clone()).await?;
    print_json(&api.write_coil(params).await?)
}

pub async fn write_register(api: &LocalApi, args: WriteRegisterArgs) -> Result<()> {
    let params = WriteRegisterParams {
        endpoint: (&args.endpoint).into(),
        address: args.address,
        value: args.value,
    };
    params.validate()?;
    api.connect(params.endpoint.clone()).await?;
    print_json(&api.write_register(params).await?)
}

pub async fn watch(api: &LocalApi, config: &PollerConfig, args: WatchArgs) -> Result<()> {
    let kind = DataKind::from(args.kind);
    let request = ReadParams {
        endpoint: (&args.endpoint).into(),
        address: args.address,
        length: args.length,
    }
    .validate(kind)?;
    let rate = args
        .rate_ms
        .map(Duration::from_millis)
        .unwrap_or(config.polling.default_rate);

    let registry = Arc::new(DeviceRegistry::new(config.polling.default_rate));
    let poller = Poller::new(api.manager().clone(), registry.clone(), &config.polling);
    let key = request.id.key();
    registry.add(key.clone());

    poller.apply(
        PollTarget::data(key.clone(), kind),
        PollSettings::new(true, rate, request.range),
    )?;
    poller.apply(
        PollTarget::online(key.clone()),
        PollSettings::online(true, rate),
    )?;
    info!(device = %key, %kind, period = ?poller.effective_period(rate), "watching");

    let mut ticker = tokio::time::interval(poller.effective_period(rate));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {}
        }

        let online = registry.get(&key).is_some_and(|device| device.online);
        let sample = registry.sample(&key, kind);
        let line = json!({
            "device": key,
            "kind": kind,
            "online": online,
            "sample": sample,
        });
        println!("{line}");

        printed += 1;
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    poller.stop_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefix_parsing() {
        assert_eq!(parse_subnet("192.168.1").unwrap(), [192, 168, 1]);
        assert_eq!(parse_subnet("10.0.0.0").unwrap(), [10, 0, 0]);
        assert!(parse_subnet("10.0").is_err());
        assert!(parse_subnet("10.0.300").is_err());
    }
}
