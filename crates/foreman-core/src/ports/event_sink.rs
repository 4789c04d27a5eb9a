//! EventSink port - イベント記録の抽象化
//!
//! 監査・運用ログの出口。emit は失敗しない（記録の失敗で状態遷移を巻き戻さない）。

use crate::domain::DomainEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);

    fn emit_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
