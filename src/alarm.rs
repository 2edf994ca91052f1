//! Expression-driven alarms.
//!
//! An alarm compiles a condition expression against the data source
//! manager; the expression's requests feed the condition, and a true
//! evaluation trips the alarm. Actions fire on the transition into the
//! triggered state, and the alarm stays triggered until the condition
//! clears and any required acknowledgement arrives.

use crate::expression::factory::TokenFactory;
use crate::expression::handler::ExpressionHandler;
use crate::expression::lexer::ParseError;
use crate::expression::token::Value as ExprValue;
use crate::source::record::{Record, Value};
use crate::source::request::{OrderOption, RequestHandle};
use crate::source::{Manager, SinkBase, SinkRef};
use crate::stamp::Stamp;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Where an alarm stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    /// Condition false, nothing outstanding.
    Off,
    /// Condition true; actions have fired.
    Triggered,
    /// Condition cleared but the trigger has not been acknowledged.
    UnacknowledgedOff,
    /// Operator acknowledged while the condition still holds.
    AcknowledgedOn,
}

/// What an alarm does when it trips.
#[derive(Debug, Clone)]
pub enum AlarmAction {
    /// Write the transition to the log.
    Log,
    /// Notify a channel with the alarm id and its latest value.
    Notify(mpsc::UnboundedSender<AlarmEvent>),
}

/// Notification sent by [`AlarmAction::Notify`] and to state clients.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    pub alarm: Uuid,
    pub name: String,
    pub state: AlarmState,
    /// The condition input value at the transition.
    pub value: f64,
    pub stamp: Stamp,
}

struct Alarm {
    id: Uuid,
    name: String,
    condition: ExpressionHandler,
    requests: Vec<RequestHandle>,
    actions: Vec<AlarmAction>,
    state: AlarmState,
    needs_ack: bool,
    last_value: f64,
    last_stamp: Stamp,
}

impl Alarm {
    fn transition(&mut self, next: AlarmState) -> bool {
        if self.state == next {
            return false;
        }
        self.state = next;
        true
    }
}

/// Manages a set of expression-driven alarms. The alarm manager is a
/// sink: register it with the data source manager through
/// [`AlarmManager::sink`].
pub struct AlarmManager {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    factory: TokenFactory,
    alarms: Vec<Alarm>,
    clients: Vec<mpsc::UnboundedSender<AlarmEvent>>,
}

struct AlarmSink {
    inner: Rc<RefCell<Inner>>,
}

impl AlarmManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                factory: TokenFactory::new(),
                alarms: Vec::new(),
                clients: Vec::new(),
            })),
        }
    }

    /// The sink to register alarm requests with.
    #[must_use]
    pub fn sink(&self) -> SinkRef {
        Rc::new(RefCell::new(AlarmSink {
            inner: self.inner.clone(),
        }))
    }

    /// Registers a channel that receives every state transition.
    pub fn add_client(&self, client: mpsc::UnboundedSender<AlarmEvent>) {
        self.inner.borrow_mut().clients.push(client);
    }

    /// Compiles a condition and registers its requests with the data
    /// source manager. The alarm trips whenever the expression is
    /// true.
    pub fn add_alarm(
        &self,
        manager: &mut Manager,
        name: &str,
        condition: &str,
        needs_ack: bool,
        actions: Vec<AlarmAction>,
    ) -> Result<Uuid, ParseError> {
        let (handler, requests) = {
            let inner = self.inner.borrow();
            inner
                .factory
                .make_expression(condition, None, OrderOption::RealTime)?
        };
        let id = Uuid::new_v4();
        let sink = self.sink();
        let count = requests.len();
        for (index, request) in requests.iter().enumerate() {
            manager.add_request(sink.clone(), request.clone(), index + 1 < count);
        }
        info!(alarm = %id, name, condition, "alarm armed");
        self.inner.borrow_mut().alarms.push(Alarm {
            id,
            name: name.to_string(),
            condition: handler,
            requests,
            actions,
            state: AlarmState::Off,
            needs_ack,
            last_value: f64::NAN,
            last_stamp: Stamp::from_nanos(0),
        });
        Ok(id)
    }

    /// Removes an alarm and cancels its requests.
    pub fn remove_alarm(&self, manager: &mut Manager, id: Uuid) {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let index = inner.alarms.iter().position(|alarm| alarm.id == id);
            index.map(|index| inner.alarms.remove(index))
        };
        if let Some(alarm) = removed {
            for request in &alarm.requests {
                manager.remove_request(request);
            }
        }
    }

    /// Acknowledges a triggered alarm.
    pub fn acknowledge(&self, id: Uuid) {
        let mut inner = self.inner.borrow_mut();
        let mut events = Vec::new();
        for alarm in &mut inner.alarms {
            if alarm.id != id {
                continue;
            }
            let next = match alarm.state {
                AlarmState::Triggered => AlarmState::AcknowledgedOn,
                AlarmState::UnacknowledgedOff => AlarmState::Off,
                other => other,
            };
            if alarm.transition(next) {
                events.push(make_event(alarm));
            }
        }
        inner.deliver(events);
    }

    /// Current state of an alarm.
    #[must_use]
    pub fn state_of(&self, id: Uuid) -> Option<AlarmState> {
        self.inner
            .borrow()
            .alarms
            .iter()
            .find(|alarm| alarm.id == id)
            .map(|alarm| alarm.state)
    }
}

impl Default for AlarmManager {
    fn default() -> Self {
        Self::new()
    }
}

fn make_event(alarm: &Alarm) -> AlarmEvent {
    AlarmEvent {
        alarm: alarm.id,
        name: alarm.name.clone(),
        state: alarm.state,
        value: alarm.last_value,
        stamp: alarm.last_stamp,
    }
}

impl Inner {
    fn deliver(&mut self, events: Vec<AlarmEvent>) {
        for event in events {
            self.clients.retain(|client| client.send(event.clone()).is_ok());
        }
    }

    fn on_records(&mut self, requests: &[RequestHandle], records: &[Record]) {
        let mut events = Vec::new();
        for alarm in &mut self.alarms {
            let feeds = requests.iter().any(|request| {
                alarm
                    .requests
                    .iter()
                    .any(|held| Arc::ptr_eq(held, request))
            });
            if !feeds {
                continue;
            }
            // Rebind every variable whose request is in this batch
            // from the newest record, then re-evaluate.
            for record in records {
                assign_variables(alarm, requests, record);
            }
            let result = match alarm.condition.evaluate() {
                Ok(result) => result,
                Err(error) => {
                    warn!(alarm = %alarm.id, %error, "alarm condition failed to evaluate");
                    continue;
                }
            };
            alarm.last_value = result;
            alarm.last_stamp = records.last().map_or(alarm.last_stamp, |record| record.stamp);
            let active = result != 0.0 && !result.is_nan();
            let next = match (alarm.state, active) {
                (AlarmState::Off, true) => AlarmState::Triggered,
                (AlarmState::Triggered, false) => {
                    if alarm.needs_ack {
                        AlarmState::UnacknowledgedOff
                    } else {
                        AlarmState::Off
                    }
                }
                (AlarmState::AcknowledgedOn, false) => AlarmState::Off,
                (AlarmState::UnacknowledgedOff, true) => AlarmState::Triggered,
                (state, _) => state,
            };
            let entering_trigger = next == AlarmState::Triggered && alarm.state != AlarmState::Triggered;
            if alarm.transition(next) {
                if entering_trigger {
                    for action in &alarm.actions {
                        match action {
                            AlarmAction::Log => {
                                info!(alarm = %alarm.id, name = alarm.name, value = alarm.last_value, "alarm triggered");
                            }
                            AlarmAction::Notify(channel) => {
                                let _ = channel.send(make_event(alarm));
                            }
                        }
                    }
                }
                events.push(make_event(alarm));
            }
        }
        self.deliver(events);
    }
}

fn assign_variables(alarm: &mut Alarm, requests: &[RequestHandle], record: &Record) {
    let names: Vec<String> = alarm.condition.variables().keys().cloned().collect();
    for name in names {
        let Some(token) = alarm.condition.variables().get(&name) else {
            continue;
        };
        let bound_request = match &*token.borrow() {
            crate::expression::token::Token::Variable(variable) => variable.request.clone(),
            _ => None,
        };
        let Some(bound) = bound_request else { continue };
        if !requests.iter().any(|request| Arc::ptr_eq(request, &bound)) {
            continue;
        }
        let column = {
            let held = bound.lock().expect("request poisoned");
            held.uri().column()
        };
        let Some(column) = column else { continue };
        let Some(value) = record.value_by_name(&column) else {
            continue;
        };
        let expr_value = match value {
            Value::Ascii(text) => ExprValue::Str(text.clone()),
            Value::Stamp(nanos) => ExprValue::Date(*nanos),
            Value::Int4(v) => ExprValue::Int(i64::from(*v)),
            Value::UInt4(v) => ExprValue::Int(i64::from(*v)),
            Value::Int8(v) => ExprValue::Int(*v),
            other => ExprValue::Float(other.to_float().unwrap_or(f64::NAN)),
        };
        alarm.condition.assign_variable(&name, expr_value, record.stamp);
    }
}

impl SinkBase for AlarmSink {
    fn on_sink_records(
        &mut self,
        _manager: &mut Manager,
        requests: &[RequestHandle],
        records: &[Record],
    ) {
        self.inner.borrow_mut().on_records(requests, records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::record::{RecordDesc, ValueDesc, ValueType};
    use crate::source::request::RequestState;
    use crate::source::{SourceEvent, SourceEventSender};
    use crate::source::{DataSource, DisconnectReason, SourceUri};

    /// Source double that replays whatever values the test scripts.
    struct ScriptedSource {
        name: String,
        events: SourceEventSender,
        connected: bool,
        queued: Vec<RequestHandle>,
        active: Vec<RequestHandle>,
    }

    impl DataSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn connect(&mut self) {
            self.connected = true;
        }

        fn disconnect(&mut self) {
            self.connected = false;
            let _ = self.events.send(SourceEvent::Disconnected {
                source: self.name.clone(),
                reason: DisconnectReason::ByApplication,
            });
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn add_request(&mut self, request: RequestHandle) {
            self.queued.push(request);
        }

        fn activate_requests(&mut self) {
            for request in self.queued.drain(..) {
                request.lock().unwrap().set_state(RequestState::Started);
                self.active.push(request);
            }
        }

        fn remove_request(&mut self, request: &RequestHandle) {
            self.active.retain(|held| !Arc::ptr_eq(held, request));
        }
    }

    fn setup(condition: &str) -> (Manager, AlarmManager, Uuid, mpsc::UnboundedReceiver<AlarmEvent>) {
        let mut manager = Manager::new();
        let source = ScriptedSource {
            name: "src".to_string(),
            events: manager.event_sender(),
            connected: true,
            queued: Vec::new(),
            active: Vec::new(),
        };
        manager.add_source(Box::new(source));
        let alarms = AlarmManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        alarms.add_client(tx);
        let id = alarms
            .add_alarm(&mut manager, "high level", condition, false, vec![AlarmAction::Log])
            .unwrap();
        (manager, alarms, id, rx)
    }

    #[test]
    fn alarm_trips_and_clears() {
        let (mut manager, alarms, id, mut rx) = setup("src:stn.tbl.level > 10");
        // Feed records straight through the manager's event channel
        // against the alarm's requests.
        let request = {
            let state = alarms.inner.borrow();
            state.alarms[0].requests[0].clone()
        };
        let mut desc = RecordDesc::new("stn", "tbl");
        desc.values.push(ValueDesc::scalar("level", ValueType::Float8));
        let mut record = Record::new(desc.clone(), Stamp::from_nanos(100), 1);
        record.values.push(Value::Float8(12.0));
        manager
            .event_sender()
            .send(SourceEvent::Records {
                requests: vec![request.clone()],
                records: vec![record],
            })
            .unwrap();
        manager.pump();
        assert_eq!(alarms.state_of(id), Some(AlarmState::Triggered));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, AlarmState::Triggered);
        assert_eq!(event.value, -1.0);

        let mut record = Record::new(desc, Stamp::from_nanos(200), 2);
        record.values.push(Value::Float8(5.0));
        manager
            .event_sender()
            .send(SourceEvent::Records {
                requests: vec![request],
                records: vec![record],
            })
            .unwrap();
        manager.pump();
        assert_eq!(alarms.state_of(id), Some(AlarmState::Off));
    }

    #[test]
    fn acknowledgement_flow() {
        let (mut manager, alarms, id, _rx) = setup("src:stn.tbl.level > 10");
        {
            let mut inner = alarms.inner.borrow_mut();
            inner.alarms[0].needs_ack = true;
        }
        let request = {
            let state = alarms.inner.borrow();
            state.alarms[0].requests[0].clone()
        };
        let mut desc = RecordDesc::new("stn", "tbl");
        desc.values.push(ValueDesc::scalar("level", ValueType::Float8));
        let mut record = Record::new(desc.clone(), Stamp::from_nanos(100), 1);
        record.values.push(Value::Float8(20.0));
        manager
            .event_sender()
            .send(SourceEvent::Records {
                requests: vec![request.clone()],
                records: vec![record],
            })
            .unwrap();
        manager.pump();
        assert_eq!(alarms.state_of(id), Some(AlarmState::Triggered));

        // Condition clears but no acknowledgement yet.
        let mut record = Record::new(desc, Stamp::from_nanos(200), 2);
        record.values.push(Value::Float8(1.0));
        manager
            .event_sender()
            .send(SourceEvent::Records {
                requests: vec![request],
                records: vec![record],
            })
            .unwrap();
        manager.pump();
        assert_eq!(alarms.state_of(id), Some(AlarmState::UnacknowledgedOff));
        alarms.acknowledge(id);
        assert_eq!(alarms.state_of(id), Some(AlarmState::Off));
    }

    #[test]
    fn removal_cancels_requests() {
        let (mut manager, alarms, id, _rx) = setup("src:stn.tbl.level > 10");
        assert_eq!(manager.request_count(), 1);
        alarms.remove_alarm(&mut manager, id);
        assert_eq!(manager.request_count(), 0);
        assert_eq!(alarms.state_of(id), None);
    }
}
