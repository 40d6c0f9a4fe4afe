use crate::error::ProcessingResult;
use crate::processing::control::CommandControl;
use crate::processing::registry::CommandProcessor;
use crate::processing::response::Outcome;
use crate::record::{AwaitResult, Intent, Record, RecordValue, RejectionType, RequestRef};
use crate::state::ProcessingState;
use crate::types::{Key, RecordPosition};

use super::creation::CreateProcessInstanceProcessor;

/// Wraps a control so an accepted creation remembers who awaits the result, and the
/// client is answered on completion instead of right away.
pub struct AwaitResultControl<'c> {
    inner: &'c mut dyn CommandControl,
    await_result: AwaitResult,
}

impl<'c> AwaitResultControl<'c> {
    pub fn new(inner: &'c mut dyn CommandControl, await_result: AwaitResult) -> Self {
        Self {
            inner,
            await_result,
        }
    }
}

impl CommandControl for AwaitResultControl<'_> {
    fn state(&self) -> &ProcessingState {
        self.inner.state()
    }

    fn next_key(&mut self) -> ProcessingResult<Key> {
        self.inner.next_key()
    }

    fn accept(
        &mut self,
        key: Key,
        intent: Intent,
        mut value: RecordValue,
    ) -> ProcessingResult<RecordPosition> {
        let mut awaited = false;
        if let RecordValue::ProcessInstanceCreation(created) = &mut value {
            if intent == Intent::Created {
                created.await_result = Some(self.await_result.clone());
                awaited = true;
            }
        }
        let position = self.inner.accept(key, intent, value)?;
        if awaited {
            self.inner.suppress_response();
        }
        Ok(position)
    }

    fn append_event(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> ProcessingResult<RecordPosition> {
        self.inner.append_event(key, intent, value)
    }

    fn append_follow_up_command(
        &mut self,
        key: Key,
        intent: Intent,
        value: RecordValue,
    ) -> RecordPosition {
        self.inner.append_follow_up_command(key, intent, value)
    }

    fn reject(&mut self, rejection_type: RejectionType, reason: String) {
        self.inner.reject(rejection_type, reason)
    }

    fn respond_to(&mut self, request: RequestRef, outcome: Outcome) {
        self.inner.respond_to(request, outcome)
    }

    fn suppress_response(&mut self) {
        self.inner.suppress_response()
    }
}

/// ProcessInstanceCreation CREATE_WITH_AWAITING_RESULT.
pub struct CreateWithAwaitingResultProcessor;

impl CommandProcessor for CreateWithAwaitingResultProcessor {
    fn on_command(
        &self,
        command: &Record,
        control: &mut dyn CommandControl,
    ) -> ProcessingResult<bool> {
        let Some(request) = command.request else {
            control.reject(
                RejectionType::InvalidArgument,
                "Expected a client request to answer with the result, but none given".to_string(),
            );
            return Ok(true);
        };
        let fetch_variables = match &command.value {
            RecordValue::ProcessInstanceCreation(creation) => creation.fetch_variables.clone(),
            _ => Vec::new(),
        };
        let mut control = AwaitResultControl::new(
            control,
            AwaitResult {
                request,
                fetch_variables,
            },
        );
        CreateProcessInstanceProcessor.on_command(command, &mut control)
    }
}
