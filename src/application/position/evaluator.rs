//! Rule-first position management.
//!
//! Checks run in strict priority order and are free of AI calls; only the
//! partial-exit decision above the profit trigger may be escalated to the
//! reviewer, and only when that is enabled.

use crate::config::TradingModeOptions;
use crate::domain::trading::{Confidence, ExitTrigger, PortfolioPosition};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const FAKEOUT_MAX_CANDLES: usize = 3;
const FAKEOUT_THRESHOLD_PCT: f64 = -2.0;
const TIMEOUT_HOURS: f64 = 24.0;
const TIMEOUT_MIN_PROFIT_PCT: f64 = 2.0;
const ADX_WEAK_THRESHOLD: f64 = 20.0;
const ADX_DROP_RATIO: f64 = 0.8;
const ADX_CHECK_MIN_HOURS: f64 = 6.0;
const TRAILING_TRIGGER_PCT: f64 = 5.0;
const TRAILING_STOP_FACTOR: Decimal = dec!(0.97);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionActionType {
    Hold,
    Exit,
    PartialExit,
    AdjustStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionAction {
    pub action: PositionActionType,
    pub trigger: Option<ExitTrigger>,
    pub reason: String,
    pub confidence: Confidence,
    pub new_stop_loss: Option<Decimal>,
    /// Fraction sold on a partial exit.
    pub exit_ratio: f64,
    pub ai_used: bool,
}

impl PositionAction {
    fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: PositionActionType::Hold,
            trigger: None,
            reason: reason.into(),
            confidence: Confidence::High,
            new_stop_loss: None,
            exit_ratio: 0.0,
            ai_used: false,
        }
    }

    fn exit(trigger: ExitTrigger, reason: String) -> Self {
        Self {
            action: PositionActionType::Exit,
            trigger: Some(trigger),
            reason,
            confidence: Confidence::High,
            new_stop_loss: None,
            exit_ratio: 1.0,
            ai_used: false,
        }
    }
}

/// Per-ticker market context collected for the management branch.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    /// Bars held on the management interval, when derivable.
    pub holding_candles: Option<usize>,
    pub current_adx: Option<f64>,
    pub prev_adx: Option<f64>,
}

pub struct PositionEvaluator {
    options: TradingModeOptions,
}

impl PositionEvaluator {
    pub fn new(options: TradingModeOptions) -> Self {
        Self { options }
    }

    pub fn evaluate(
        &self,
        position: &PortfolioPosition,
        market: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> PositionAction {
        let profit_rate = position.profit_rate();
        let holding_hours = position.holding_hours(now);
        let current = position.current_price;

        // 1. Stop-loss.
        if profit_rate <= self.options.stop_loss_pct {
            return PositionAction::exit(
                ExitTrigger::StopLoss,
                format!(
                    "stop-loss: {:+.2}% <= {:.2}%",
                    profit_rate, self.options.stop_loss_pct
                ),
            );
        }

        // 2. Take-profit.
        if profit_rate >= self.options.take_profit_pct {
            return PositionAction::exit(
                ExitTrigger::TakeProfit,
                format!(
                    "take-profit: {:+.2}% >= {:.2}%",
                    profit_rate, self.options.take_profit_pct
                ),
            );
        }

        // 3. Trailing stop, when one has been set.
        if let Some(stop) = position.stop_loss
            && current <= stop
        {
            return PositionAction::exit(
                ExitTrigger::TrailingStop,
                format!("trailing stop: {} <= {}", current, stop),
            );
        }

        // 4. Fakeout: early adverse move right after entry.
        let holding_candles = market
            .holding_candles
            .unwrap_or_else(|| holding_hours.floor() as usize);
        if holding_candles <= FAKEOUT_MAX_CANDLES && profit_rate <= FAKEOUT_THRESHOLD_PCT {
            return PositionAction::exit(
                ExitTrigger::Fakeout,
                format!(
                    "fakeout: {:+.2}% within {} candles of entry",
                    profit_rate, holding_candles
                ),
            );
        }

        // 5. Timeout: no momentum after a day.
        if holding_hours >= TIMEOUT_HOURS && profit_rate < TIMEOUT_MIN_PROFIT_PCT {
            return PositionAction::exit(
                ExitTrigger::Timeout,
                format!(
                    "timeout: {:.1}h held, {:+.2}% below the {:.0}% minimum",
                    holding_hours, profit_rate, TIMEOUT_MIN_PROFIT_PCT
                ),
            );
        }

        // 6. ADX collapse after the position has had time to work.
        if holding_hours >= ADX_CHECK_MIN_HOURS
            && let (Some(adx), Some(prev_adx)) = (market.current_adx, market.prev_adx)
            && adx < ADX_WEAK_THRESHOLD
            && adx <= prev_adx * ADX_DROP_RATIO
        {
            return PositionAction::exit(
                ExitTrigger::AdxWeak,
                format!("trend faded: ADX {:.1} from {:.1}", adx, prev_adx),
            );
        }

        // 7. Trailing adjust: lock in gains past +5%. Never lowers an
        // existing stop.
        if profit_rate >= TRAILING_TRIGGER_PCT {
            let new_stop = current * TRAILING_STOP_FACTOR;
            let should_raise = match position.stop_loss {
                Some(existing) => new_stop > existing,
                None => true,
            };
            if should_raise {
                return PositionAction {
                    action: PositionActionType::AdjustStop,
                    trigger: None,
                    reason: format!("{:+.2}% profit, trail stop to {:.0}", profit_rate, new_stop),
                    confidence: Confidence::High,
                    new_stop_loss: Some(new_stop.round_dp(8)),
                    exit_ratio: 0.0,
                    ai_used: false,
                };
            }
        }

        // 8. Partial-exit escalation above the profit trigger, reached only
        // once the stop is already trailed up to the current price.
        if self.options.ai_review_enabled && profit_rate >= self.options.partial_exit_trigger_pct {
            return PositionAction {
                action: PositionActionType::PartialExit,
                trigger: None,
                reason: format!(
                    "{:+.2}% above partial-exit trigger, escalate to reviewer",
                    profit_rate
                ),
                confidence: Confidence::Medium,
                new_stop_loss: None,
                exit_ratio: self.options.partial_exit_ratio,
                ai_used: true,
            };
        }

        PositionAction::hold("no exit rule matched")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(entry: Decimal, current: Decimal, hours_held: i64) -> PortfolioPosition {
        PortfolioPosition {
            ticker: "KRW-ETH".to_string(),
            symbol: "ETH".to_string(),
            amount: dec!(1),
            avg_buy_price: entry,
            current_price: current,
            entry_time: Some(Utc::now() - chrono::Duration::hours(hours_held)),
            stop_loss: None,
        }
    }

    fn evaluator() -> PositionEvaluator {
        PositionEvaluator::new(TradingModeOptions::default())
    }

    #[test]
    fn test_stop_loss_has_top_priority() {
        let pos = position(dec!(100), dec!(94), 1);
        let action = evaluator().evaluate(&pos, &MarketSnapshot::default(), Utc::now());
        assert_eq!(action.action, PositionActionType::Exit);
        assert_eq!(action.trigger, Some(ExitTrigger::StopLoss));
    }

    #[test]
    fn test_take_profit_exit() {
        let pos = position(dec!(100), dec!(111), 5);
        let action = evaluator().evaluate(&pos, &MarketSnapshot::default(), Utc::now());
        assert_eq!(action.trigger, Some(ExitTrigger::TakeProfit));
    }

    #[test]
    fn test_trailing_stop_hit() {
        let mut pos = position(dec!(100), dec!(103), 10);
        pos.stop_loss = Some(dec!(104));
        let action = evaluator().evaluate(&pos, &MarketSnapshot::default(), Utc::now());
        assert_eq!(action.trigger, Some(ExitTrigger::TrailingStop));
    }

    #[test]
    fn test_fakeout_within_three_candles() {
        let pos = position(dec!(100), dec!(97.5), 2);
        let market = MarketSnapshot {
            holding_candles: Some(2),
            ..Default::default()
        };
        let action = evaluator().evaluate(&pos, &market, Utc::now());
        assert_eq!(action.trigger, Some(ExitTrigger::Fakeout));
    }

    #[test]
    fn test_timeout_needs_low_profit() {
        let stale = position(dec!(100), dec!(101), 30);
        let market = MarketSnapshot {
            holding_candles: Some(30),
            ..Default::default()
        };
        let action = evaluator().evaluate(&stale, &market, Utc::now());
        assert_eq!(action.trigger, Some(ExitTrigger::Timeout));

        // Same age with 3% profit holds.
        let working = position(dec!(100), dec!(103), 30);
        let action = evaluator().evaluate(&working, &market, Utc::now());
        assert_eq!(action.action, PositionActionType::Hold);
    }

    #[test]
    fn test_adx_collapse_exit() {
        let pos = position(dec!(100), dec!(101), 8);
        let market = MarketSnapshot {
            holding_candles: Some(8),
            current_adx: Some(15.0),
            prev_adx: Some(22.0),
        };
        let action = evaluator().evaluate(&pos, &market, Utc::now());
        assert_eq!(action.trigger, Some(ExitTrigger::AdxWeak));
    }

    #[test]
    fn test_trailing_adjust_at_five_percent() {
        let pos = position(dec!(100), dec!(106), 8);
        let market = MarketSnapshot {
            holding_candles: Some(8),
            ..Default::default()
        };
        let action = evaluator().evaluate(&pos, &market, Utc::now());
        assert_eq!(action.action, PositionActionType::AdjustStop);
        let stop = action.new_stop_loss.unwrap();
        assert_eq!(stop, dec!(106) * dec!(0.97));
    }

    #[test]
    fn test_trailing_adjust_runs_before_partial_exit() {
        // +12% with no stop yet: the ladder must trail the stop first, even
        // with the reviewer enabled.
        let mut options = TradingModeOptions::default();
        options.take_profit_pct = 20.0; // keep take-profit out of the way
        options.ai_review_enabled = true;
        let eval = PositionEvaluator::new(options);
        let pos = position(dec!(100), dec!(112), 8);
        let action = eval.evaluate(&pos, &MarketSnapshot::default(), Utc::now());
        assert_eq!(action.action, PositionActionType::AdjustStop);
        assert_eq!(action.new_stop_loss, Some(dec!(112) * dec!(0.97)));
    }

    #[test]
    fn test_partial_exit_escalation_only_with_ai() {
        // Stop already trailed above current * 0.97, so the trailing rule is
        // a no-op and the ladder falls through to the partial-exit check.
        let mut options = TradingModeOptions::default();
        options.take_profit_pct = 20.0;
        options.ai_review_enabled = true;
        let eval = PositionEvaluator::new(options.clone());
        let mut pos = position(dec!(100), dec!(112), 8);
        pos.stop_loss = Some(dec!(109));
        let action = eval.evaluate(&pos, &MarketSnapshot::default(), Utc::now());
        assert_eq!(action.action, PositionActionType::PartialExit);
        assert!((action.exit_ratio - 0.5).abs() < 1e-9);

        options.ai_review_enabled = false;
        let eval = PositionEvaluator::new(options);
        let action = eval.evaluate(&pos, &MarketSnapshot::default(), Utc::now());
        // Without the reviewer the rule layer holds.
        assert_eq!(action.action, PositionActionType::Hold);
    }
}
