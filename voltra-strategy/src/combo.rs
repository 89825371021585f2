//! Combo builder: turns a map of named option roles into a signed leg list
//! plus the canonical combo signature.
//!
//! Leg-sign recipes are compile-time per combo type: a long straddle is
//! long call + long put, a long iron condor is long put_lower / short
//! put_upper / short call_lower / long call_upper, and so on. `Custom`
//! takes every provided role at the given direction.

use std::collections::HashMap;

use voltra_core::util::JOIN_SYMBOL;
use voltra_core::{ComboType, ContractData, Direction, Leg, Symbol};
use voltra_portfolio::OptionData;

use crate::{StrategyError, StrategyResult};

/// Fixed short-leg multiple of a ratio spread.
const RATIO_SPREAD_RATIO: i32 = 2;

/// Build the leg list and signature for `combo_type` from the named roles.
pub fn build_combo(
    combo_type: ComboType,
    roles: &HashMap<&str, &OptionData>,
    direction: Direction,
    volume: i32,
    contracts: &HashMap<Symbol, ContractData>,
) -> StrategyResult<(Vec<Leg>, String)> {
    let volume = volume.abs().max(1);
    let legs = match combo_type {
        ComboType::Straddle | ComboType::Strangle => {
            let call = role(roles, "call", combo_type)?;
            let put = role(roles, "put", combo_type)?;
            vec![
                create_leg(call, direction, volume, contracts)?,
                create_leg(put, direction, volume, contracts)?,
            ]
        }
        ComboType::Spread | ComboType::DiagonalSpread | ComboType::RiskReversal => {
            let long_leg = role(roles, "long_leg", combo_type)?;
            let short_leg = role(roles, "short_leg", combo_type)?;
            vec![
                create_leg(long_leg, direction, volume, contracts)?,
                create_leg(short_leg, direction.inverse(), volume, contracts)?,
            ]
        }
        ComboType::RatioSpread => {
            let long_leg = role(roles, "long_leg", combo_type)?;
            let short_leg = role(roles, "short_leg", combo_type)?;
            vec![
                create_leg(long_leg, direction, volume, contracts)?,
                create_leg(
                    short_leg,
                    direction.inverse(),
                    volume * RATIO_SPREAD_RATIO,
                    contracts,
                )?,
            ]
        }
        ComboType::Butterfly => {
            let body = role(roles, "body", combo_type)?;
            let wing1 = role(roles, "wing1", combo_type)?;
            let wing2 = role(roles, "wing2", combo_type)?;
            vec![
                create_leg(body, direction, volume, contracts)?,
                create_leg(wing1, direction.inverse(), volume, contracts)?,
                create_leg(wing2, direction.inverse(), volume, contracts)?,
            ]
        }
        ComboType::InverseButterfly => {
            let body = role(roles, "body", combo_type)?;
            let wing1 = role(roles, "wing1", combo_type)?;
            let wing2 = role(roles, "wing2", combo_type)?;
            vec![
                create_leg(body, direction.inverse(), volume, contracts)?,
                create_leg(wing1, direction, volume, contracts)?,
                create_leg(wing2, direction, volume, contracts)?,
            ]
        }
        ComboType::IronButterfly => {
            let put_wing = role(roles, "put_wing", combo_type)?;
            let body = role(roles, "body", combo_type)?;
            let call_wing = role(roles, "call_wing", combo_type)?;
            vec![
                create_leg(put_wing, direction, volume, contracts)?,
                create_leg(body, direction.inverse(), volume, contracts)?,
                create_leg(call_wing, direction, volume, contracts)?,
            ]
        }
        ComboType::IronCondor => {
            let put_lower = role(roles, "put_lower", combo_type)?;
            let put_upper = role(roles, "put_upper", combo_type)?;
            let call_lower = role(roles, "call_lower", combo_type)?;
            let call_upper = role(roles, "call_upper", combo_type)?;
            vec![
                create_leg(put_lower, direction, volume, contracts)?,
                create_leg(put_upper, direction.inverse(), volume, contracts)?,
                create_leg(call_lower, direction.inverse(), volume, contracts)?,
                create_leg(call_upper, direction, volume, contracts)?,
            ]
        }
        ComboType::Condor | ComboType::BoxSpread => {
            let long_put = role(roles, "long_put", combo_type)?;
            let short_put = role(roles, "short_put", combo_type)?;
            let short_call = role(roles, "short_call", combo_type)?;
            let long_call = role(roles, "long_call", combo_type)?;
            vec![
                create_leg(long_put, direction, volume, contracts)?,
                create_leg(short_put, direction.inverse(), volume, contracts)?,
                create_leg(short_call, direction.inverse(), volume, contracts)?,
                create_leg(long_call, direction, volume, contracts)?,
            ]
        }
        ComboType::Custom => {
            // Deterministic leg order: sort by role name.
            let mut entries: Vec<(&&str, &&OptionData)> = roles.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut legs = Vec::with_capacity(entries.len());
            for (_, option) in entries {
                legs.push(create_leg(option, direction, volume, contracts)?);
            }
            legs
        }
    };
    if legs.is_empty() {
        return Err(StrategyError::InvalidConfig(format!(
            "combo {combo_type:?} produced no legs"
        )));
    }
    let signature = combo_signature(&legs);
    Ok((legs, signature))
}

fn role<'a>(
    roles: &HashMap<&str, &'a OptionData>,
    name: &str,
    combo_type: ComboType,
) -> StrategyResult<&'a OptionData> {
    roles.get(name).copied().ok_or_else(|| {
        StrategyError::InvalidConfig(format!("combo {combo_type:?} requires role '{name}'"))
    })
}

fn create_leg(
    option: &OptionData,
    direction: Direction,
    ratio: i32,
    contracts: &HashMap<Symbol, ContractData>,
) -> StrategyResult<Leg> {
    let contract = contracts.get(&option.symbol).ok_or_else(|| {
        StrategyError::InvalidConfig(format!("contract not found for option: {}", option.symbol))
    })?;
    Ok(Leg {
        symbol: contract.symbol.clone(),
        exchange: contract.exchange,
        ratio,
        direction,
        price: None,
    })
}

/// Canonical identifier of a leg set: per leg, drop the underlying token
/// of the symbol and concatenate the next three (expiry, type, strike);
/// sort the parts and join with `-`. Order of the input legs is irrelevant.
#[must_use]
pub fn combo_signature(legs: &[Leg]) -> String {
    let mut parts: Vec<String> = legs
        .iter()
        .filter_map(|leg| {
            let tokens: Vec<&str> = leg.symbol.split(JOIN_SYMBOL).collect();
            if tokens.len() >= 4 {
                Some(format!("{}{}{}", tokens[1], tokens[2], tokens[3]))
            } else {
                None
            }
        })
        .collect();
    parts.sort();
    parts.join(JOIN_SYMBOL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use voltra_core::util::option_symbol;
    use voltra_core::{Exchange, OptionType, Product};

    fn fixture(
        strike: f64,
        option_type: OptionType,
    ) -> (OptionData, ContractData) {
        let expiry = Utc.with_ymd_and_hms(2025, 2, 20, 21, 0, 0).unwrap();
        let symbol = option_symbol("SPXW", expiry, option_type, strike, 100);
        let contract = ContractData {
            symbol: symbol.clone(),
            exchange: Exchange::Smart,
            name: symbol.clone(),
            product: Product::Option,
            size: 100.0,
            pricetick: 0.01,
            min_volume: 1.0,
            option_strike: Some(strike),
            option_underlying: Some("SPXW".into()),
            option_type: Some(option_type),
            option_expiry: Some(expiry),
            option_index: Some(format!("{}", strike as i64)),
        };
        let mut portfolio = voltra_portfolio::Portfolio::new("t");
        portfolio.add_option(&contract);
        let option = portfolio.option(&symbol).unwrap().clone();
        (option, contract)
    }

    #[test]
    fn straddle_signature_is_insertion_order_independent() {
        let (call, call_contract) = fixture(4500.0, OptionType::Call);
        let (put, put_contract) = fixture(4500.0, OptionType::Put);
        let contracts = HashMap::from([
            (call_contract.symbol.clone(), call_contract.clone()),
            (put_contract.symbol.clone(), put_contract.clone()),
        ]);

        let forward = HashMap::from([("call", &call), ("put", &put)]);
        let (legs_a, sig_a) =
            build_combo(ComboType::Straddle, &forward, Direction::Long, 1, &contracts).unwrap();

        // Same roles, produced through the reverse-ordered custom path.
        let reversed = HashMap::from([("b_put", &put), ("a_call", &call)]);
        let (_, sig_b) =
            build_combo(ComboType::Custom, &reversed, Direction::Long, 1, &contracts).unwrap();

        assert_eq!(sig_a, "20250220C4500-20250220P4500");
        assert_eq!(sig_a, sig_b);
        assert_eq!(legs_a.len(), 2);
        assert!(legs_a.iter().all(|leg| leg.direction == Direction::Long));
    }

    #[test]
    fn iron_condor_long_signs() {
        let (put_lower, c1) = fixture(4300.0, OptionType::Put);
        let (put_upper, c2) = fixture(4400.0, OptionType::Put);
        let (call_lower, c3) = fixture(4600.0, OptionType::Call);
        let (call_upper, c4) = fixture(4700.0, OptionType::Call);
        let contracts: HashMap<_, _> = [c1, c2, c3, c4]
            .into_iter()
            .map(|c| (c.symbol.clone(), c))
            .collect();
        let roles = HashMap::from([
            ("put_lower", &put_lower),
            ("put_upper", &put_upper),
            ("call_lower", &call_lower),
            ("call_upper", &call_upper),
        ]);
        let (legs, _) =
            build_combo(ComboType::IronCondor, &roles, Direction::Long, 1, &contracts).unwrap();
        let directions: Vec<Direction> = legs.iter().map(|leg| leg.direction).collect();
        assert_eq!(
            directions,
            [
                Direction::Long,
                Direction::Short,
                Direction::Short,
                Direction::Long
            ]
        );
    }

    #[test]
    fn ratio_spread_doubles_the_short_leg() {
        let (long_leg, c1) = fixture(4500.0, OptionType::Call);
        let (short_leg, c2) = fixture(4600.0, OptionType::Call);
        let contracts: HashMap<_, _> = [c1, c2]
            .into_iter()
            .map(|c| (c.symbol.clone(), c))
            .collect();
        let roles = HashMap::from([("long_leg", &long_leg), ("short_leg", &short_leg)]);
        let (legs, _) =
            build_combo(ComboType::RatioSpread, &roles, Direction::Long, 2, &contracts).unwrap();
        assert_eq!(legs[0].ratio, 2);
        assert_eq!(legs[1].ratio, 4);
        assert_eq!(legs[1].direction, Direction::Short);
    }

    #[test]
    fn missing_role_is_a_config_error() {
        let (call, contract) = fixture(4500.0, OptionType::Call);
        let contracts = HashMap::from([(contract.symbol.clone(), contract)]);
        let roles = HashMap::from([("call", &call)]);
        let err = build_combo(ComboType::Straddle, &roles, Direction::Long, 1, &contracts)
            .unwrap_err();
        assert!(matches!(err, StrategyError::InvalidConfig(_)));
    }

    #[test]
    fn missing_contract_is_rejected() {
        let (call, _) = fixture(4500.0, OptionType::Call);
        let (put, put_contract) = fixture(4500.0, OptionType::Put);
        let contracts = HashMap::from([(put_contract.symbol.clone(), put_contract)]);
        let roles = HashMap::from([("call", &call), ("put", &put)]);
        assert!(build_combo(ComboType::Straddle, &roles, Direction::Long, 1, &contracts).is_err());
    }
}
