//! Control-plane surface: the coarse request/response vocabulary a
//! transport (gRPC or otherwise) maps onto the live engine. The transport
//! itself lives outside this crate.

use serde::{Deserialize, Serialize};
use voltra_core::{OrderData, StrategySetting, TradeData};

/// Requests accepted by [`crate::LiveEngine::handle_control`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    ConnectGateway,
    DisconnectGateway,
    StartMarketData,
    StopMarketData,
    AddStrategy {
        class_name: String,
        portfolio_name: String,
        /// Flat `{string -> number}` map; unknown keys are ignored.
        setting_json: String,
    },
    InitStrategy {
        strategy_name: String,
    },
    StartStrategy {
        strategy_name: String,
    },
    StopStrategy {
        strategy_name: String,
    },
    RemoveStrategy {
        strategy_name: String,
    },
    ListPortfolios,
    ListStrategyClasses,
    ListStrategies,
    HistoricalOrders {
        strategy_name: String,
    },
    HistoricalTrades {
        strategy_name: String,
    },
}

/// Responses of the control surface.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Error { message: String },
    Names { names: Vec<String>  },
    StrategyName { strategy_name: String },
    Orders { orders: Vec<OrderData> },
    Trades { trades: Vec<TradeData> },
}

impl ControlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// One strategy lifecycle notification pushed to streaming consumers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyUpdate {
    pub strategy_name: String,
    pub class_name: String,
    pub portfolio: String,
    pub json_payload: String,
}

/// Parse an `AddStrategy.setting_json` payload: a flat JSON object whose
/// numeric members become settings; everything else is ignored.
#[must_use]
pub fn parse_setting_json(setting_json: &str) -> StrategySetting {
    let mut setting = StrategySetting::new();
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(setting_json) {
        for (key, value) in map {
            if let Some(number) = value.as_f64() {
                setting.insert(key, number);
            }
        }
    }
    setting
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_json_keeps_numbers_only() {
        let setting =
            parse_setting_json(r#"{"timer_trigger": 5, "position_size": 2.5, "name": "x"}"#);
        assert_eq!(setting.get("timer_trigger"), Some(&5.0));
        assert_eq!(setting.get("position_size"), Some(&2.5));
        assert_eq!(setting.len(), 2);
        assert!(parse_setting_json("not json").is_empty());
        assert!(parse_setting_json("[1,2]").is_empty());
    }

    #[test]
    fn requests_round_trip_as_json() {
        let request = ControlRequest::AddStrategy {
            class_name: "StraddleCycle".into(),
            portfolio_name: "SPXW".into(),
            setting_json: "{}".into(),
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ControlRequest::AddStrategy { .. }));
    }
}
